use std::env;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use url::Url;

use crate::transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_MAX_FILE_SIZE};

pub const DEFAULT_ENDPOINT: &str = "http://127.0.0.1:5001";
pub const ENDPOINT_ENV: &str = "MESHLANE_ENDPOINT";
pub const DEFAULT_STUN: &str = "stun:stun.l.google.com:19302";

/// Bounded retry schedule for a lost signaling connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
  pub max_attempts: u32,
  pub initial_delay: Duration,
  pub retry_delay: Duration,
}

impl Default for ReconnectPolicy {
  fn default() -> Self {
    Self {
      max_attempts: 5,
      initial_delay: Duration::from_millis(500),
      retry_delay: Duration::from_secs(2),
    }
  }
}

impl ReconnectPolicy {
  pub fn disabled() -> Self {
    Self {
      max_attempts: 0,
      ..Self::default()
    }
  }

  /// Delay before the given 1-based attempt, or `None` once the budget is spent.
  pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
    match attempt {
      n if n > self.max_attempts => None,
      1 => Some(self.initial_delay),
      _ => Some(self.retry_delay),
    }
  }
}

/// How the session enters its room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Intent {
  Create { room_name: Option<String> },
  Join,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
  pub endpoint: Url,
  pub room_id: String,
  pub name: String,
  pub passphrase: String,
  pub intent: Intent,
  pub output_dir: PathBuf,
  pub chunk_size: usize,
  pub max_file_size: u64,
  pub transfer_timeout: Option<Duration>,
  pub reconnect: ReconnectPolicy,
  pub ice_servers: Vec<String>,
}

impl SessionConfig {
  pub fn new(endpoint: Url, room_id: impl Into<String>, name: impl Into<String>, passphrase: impl Into<String>, intent: Intent) -> Self {
    Self {
      endpoint,
      room_id: room_id.into(),
      name: name.into(),
      passphrase: passphrase.into(),
      intent,
      output_dir: PathBuf::from("."),
      chunk_size: DEFAULT_CHUNK_SIZE,
      max_file_size: DEFAULT_MAX_FILE_SIZE,
      transfer_timeout: None,
      reconnect: ReconnectPolicy::default(),
      ice_servers: vec![DEFAULT_STUN.to_string()],
    }
  }

  pub fn ws_url(&self) -> Result<Url> {
    build_ws_url(&self.endpoint)
  }
}

/// Normalizes an endpoint to an http(s) origin. Falls back to
/// `MESHLANE_ENDPOINT`, then the local default.
pub fn base_endpoint_url(endpoint: Option<&str>) -> Result<Url> {
  let endpoint = endpoint
    .map(|value| value.to_string())
    .or_else(|| env::var(ENDPOINT_ENV).ok())
    .unwrap_or_else(|| DEFAULT_ENDPOINT.to_string());

  let mut url = Url::parse(&endpoint)?;
  let scheme = match url.scheme() {
    "https" | "http" => url.scheme().to_string(),
    "wss" => "https".to_string(),
    "ws" => "http".to_string(),
    other => return Err(anyhow!("Unsupported endpoint scheme: {other}")),
  };
  url.set_scheme(&scheme).map_err(|_| anyhow!("Invalid endpoint scheme"))?;
  url.set_path("");
  url.set_query(None);
  url.set_fragment(None);
  Ok(url)
}

pub fn build_ws_url(endpoint: &Url) -> Result<Url> {
  let mut url = endpoint.clone();
  let scheme = match url.scheme() {
    "https" | "wss" => "wss",
    "http" | "ws" => "ws",
    other => return Err(anyhow!("Unsupported endpoint scheme: {other}")),
  };
  url.set_scheme(scheme).map_err(|_| anyhow!("Invalid endpoint scheme"))?;
  url.set_path("/ws");
  url.set_query(None);
  Ok(url)
}

pub fn health_url(endpoint: &Url) -> Url {
  let mut url = endpoint.clone();
  url.set_path("/health");
  url.set_query(None);
  url
}

/// Adds the `stun:` scheme to bare `host:port` entries.
pub fn normalize_ice_server(value: &str) -> String {
  let value = value.trim();
  if ["stun:", "stuns:", "turn:", "turns:"]
    .iter()
    .any(|prefix| value.starts_with(prefix))
  {
    value.to_string()
  } else {
    format!("stun:{value}")
  }
}

//! Relay configuration loaded from environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct RelayConfig {
  /// Env: `HTTP_ADDR`, or `PORT` to bind `0.0.0.0:<PORT>`.
  /// Default: `0.0.0.0:5001`
  pub http_addr: SocketAddr,

  /// Directory served for any path that is not `/ws` or `/health`.
  /// Env: `STATIC_DIR`
  pub static_dir: Option<PathBuf>,

  /// Largest WebSocket message accepted from a client.
  /// Env: `MAX_MESSAGE_BYTES`
  /// Default: 64 KiB
  pub max_message_bytes: usize,
}

impl Default for RelayConfig {
  fn default() -> Self {
    Self {
      http_addr: ([0, 0, 0, 0], 5001).into(),
      static_dir: None,
      max_message_bytes: 64 * 1024,
    }
  }
}

impl RelayConfig {
  pub fn from_env() -> Self {
    Self::from_lookup(|key| std::env::var(key).ok())
  }

  fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
    let mut config = Self::default();

    if let Some(port) = lookup("PORT") {
      match port.parse::<u16>() {
        Ok(port) => config.http_addr.set_port(port),
        Err(_) => tracing::warn!(value = %port, "Invalid PORT, using default"),
      }
    }

    if let Some(addr) = lookup("HTTP_ADDR") {
      match addr.parse::<SocketAddr>() {
        Ok(parsed) => config.http_addr = parsed,
        Err(_) => tracing::warn!(value = %addr, "Invalid HTTP_ADDR, using default"),
      }
    }

    if let Some(dir) = lookup("STATIC_DIR").filter(|dir| !dir.is_empty()) {
      config.static_dir = Some(PathBuf::from(dir));
    }

    if let Some(value) = lookup("MAX_MESSAGE_BYTES") {
      if let Ok(n) = value.parse::<usize>() {
        config.max_message_bytes = n.max(1024);
      }
    }

    config
  }
}

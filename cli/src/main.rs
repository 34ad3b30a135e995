use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use meshlane_cli::config::{base_endpoint_url, health_url, normalize_ice_server};
use meshlane_cli::console::{log_line, parse_command, UserCommand, HELP};
use meshlane_cli::transfer::{DEFAULT_CHUNK_SIZE, MAX_CHUNK_SIZE, MIN_CHUNK_SIZE};
use meshlane_cli::{session, Intent, ReconnectPolicy, SessionConfig, SessionEnd, WebRtcConnector};
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "meshlane")]
#[command(about = "Encrypted mesh chat and file sharing over WebRTC")]
#[command(version)]
struct Cli {
  #[command(subcommand)]
  command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Create a room and wait for others to join
  Create {
    #[command(flatten)]
    room: RoomArgs,
    #[arg(long = "room-name", value_name = "NAME", help = "Display name for the room (defaults to the id)")]
    room_name: Option<String>,
  },
  /// Join an existing room
  Join {
    #[command(flatten)]
    room: RoomArgs,
  },
  /// Probe the relay's health endpoint
  Health {
    #[arg(long, env = "MESHLANE_ENDPOINT", value_name = "URL", help = "Signaling relay endpoint")]
    endpoint: Option<String>,
  },
}

#[derive(Args, Debug)]
struct RoomArgs {
  #[arg(value_name = "ROOM_ID", help = "Room identifier shared with the other participants")]
  room: String,
  #[arg(long, short = 'n', value_name = "NAME", help = "Your display name")]
  name: String,
  #[arg(long, env = "MESHLANE_PASSPHRASE", hide_env_values = true, value_name = "PASSPHRASE", help = "Room passphrase (derives the encryption key)")]
  passphrase: String,
  #[arg(long, env = "MESHLANE_ENDPOINT", value_name = "URL", help = "Signaling relay endpoint")]
  endpoint: Option<String>,
  #[arg(long, default_value = ".", value_name = "DIR", help = "Where received files are written")]
  output_dir: PathBuf,
  #[arg(long, default_value_t = DEFAULT_CHUNK_SIZE, value_name = "BYTES", help = "File chunk size")]
  chunk_size: usize,
  #[arg(long, value_name = "SECS", help = "Drop incoming transfers idle for this many seconds")]
  transfer_timeout: Option<u64>,
  #[arg(long = "stun", value_name = "URL", help = "ICE server, repeatable (default: Google STUN)")]
  stun: Vec<String>,
  #[arg(long, help = "Exit instead of reconnecting when the relay connection drops")]
  no_reconnect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
  let cli = Cli::parse();
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,webrtc=warn,webrtc_ice=warn,webrtc_sctp=warn")),
    )
    .with_writer(std::io::stderr)
    .init();

  match cli.command {
    Command::Create { room, room_name } => run_room(room, Intent::Create { room_name }).await,
    Command::Join { room } => run_room(room, Intent::Join).await,
    Command::Health { endpoint } => run_health(endpoint.as_deref()).await,
  }
}

fn session_config(args: RoomArgs, intent: Intent) -> Result<SessionConfig> {
  let room_id = args.room.trim();
  if room_id.is_empty() {
    bail!("Room ID is required");
  }
  let name = args.name.trim();
  if name.is_empty() {
    bail!("Display name is required");
  }
  if args.passphrase.is_empty() {
    bail!("Passphrase is required");
  }
  if !(MIN_CHUNK_SIZE..=MAX_CHUNK_SIZE).contains(&args.chunk_size) {
    bail!("Chunk size must be between {MIN_CHUNK_SIZE} and {MAX_CHUNK_SIZE} bytes");
  }
  let endpoint = base_endpoint_url(args.endpoint.as_deref())?;

  let mut config = SessionConfig::new(endpoint, room_id, name, args.passphrase, intent);
  config.output_dir = args.output_dir;
  config.chunk_size = args.chunk_size;
  config.transfer_timeout = args
    .transfer_timeout
    .filter(|secs| *secs > 0)
    .map(Duration::from_secs);
  if !args.stun.is_empty() {
    config.ice_servers = args.stun.iter().map(|value| normalize_ice_server(value)).collect();
  }
  if args.no_reconnect {
    config.reconnect = ReconnectPolicy::disabled();
  }
  Ok(config)
}

async fn run_room(args: RoomArgs, intent: Intent) -> Result<()> {
  let config = session_config(args, intent)?;
  let room_id = config.room_id.clone();
  log_line("[room] id", &room_id);
  log_line("[room] relay", &config.endpoint);
  log_line("[help]", HELP);

  let (command_tx, command_rx) = mpsc::unbounded_channel();
  tokio::spawn(read_commands(command_tx.clone()));
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      log_line("[room] interrupted", "leaving");
      let _ = command_tx.send(UserCommand::Leave);
    }
  });

  let connector = Arc::new(WebRtcConnector::new(config.ice_servers.clone()));
  match session::run(config, connector, command_rx).await.context("session ended")? {
    SessionEnd::Left => {
      log_line("[room] left", &room_id);
      Ok(())
    }
    SessionEnd::Kicked(message) => Err(anyhow!("removed from {room_id}: {message}")),
  }
}

async fn read_commands(tx: mpsc::UnboundedSender<UserCommand>) {
  let mut lines = BufReader::new(tokio::io::stdin()).lines();
  loop {
    let line = match lines.next_line().await {
      Ok(Some(line)) => line,
      Ok(None) => {
        let _ = tx.send(UserCommand::Leave);
        break;
      }
      Err(err) => {
        warn!(error = %err, "stdin read failed");
        let _ = tx.send(UserCommand::Leave);
        break;
      }
    };
    match parse_command(&line) {
      Some(Ok(command)) => {
        let leaving = command == UserCommand::Leave;
        if tx.send(command).is_err() || leaving {
          break;
        }
      }
      Some(Err(message)) => log_line("[input]", message),
      None => {}
    }
  }
}

async fn run_health(endpoint: Option<&str>) -> Result<()> {
  #[derive(Deserialize)]
  struct Health {
    ok: bool,
    rooms: usize,
    connections: usize,
  }

  let url = health_url(&base_endpoint_url(endpoint)?);
  let response = reqwest::Client::new()
    .get(url.clone())
    .send()
    .await
    .context("health request")?;
  let response = response.error_for_status().context("health response")?;
  let body: Health = response.json().await.context("parse health response")?;
  log_line(
    "[health]",
    format!("{url} ok={} rooms={} connections={}", body.ok, body.rooms, body.connections),
  );
  if !body.ok {
    bail!("relay reported unhealthy");
  }
  Ok(())
}

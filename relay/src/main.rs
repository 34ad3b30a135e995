use meshlane_relay::{serve, AppState, RelayConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,meshlane_relay=debug")))
    .init();

  let config = RelayConfig::from_env();
  info!(?config, "Starting meshlane relay v{}", env!("CARGO_PKG_VERSION"));
  let addr = config.http_addr;

  tokio::select! {
    result = serve(AppState::new(config), addr) => {
      if let Err(err) = &result {
        tracing::error!(error = %err, "relay server failed");
      }
      result
    }
    _ = tokio::signal::ctrl_c() => {
      info!("Received Ctrl+C, shutting down");
      Ok(())
    }
  }
}

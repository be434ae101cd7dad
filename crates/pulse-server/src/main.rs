//! # pulse
//!
//! Long-poll event server: clients wait on `GET /events` until something in
//! their rooms or their contacts' presence changes.
//!
//! ```bash
//! pulse                                   # pulse.toml or defaults
//! PULSE_CONFIG=/srv/pulse.toml pulse      # explicit config file
//! PULSE_HOST=0.0.0.0 PULSE_PORT=8008 pulse
//! RUST_LOG=tenvis_pulse_core=trace pulse  # per-source query tracing
//! ```
//!
//! Routes:
//!
//! - `GET /events?user_id=..&from=..&limit=..&timeout=..`
//! - `POST /rooms/:room_id/join`
//! - `POST /rooms/:room_id/send`
//! - `PUT /presence/:user_id`
//! - `GET /health`

mod config;
mod handlers;
mod metrics;

use config::Config;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const DEFAULT_FILTER: &str = "pulse=debug,tenvis_pulse_core=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| DEFAULT_FILTER.into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load()?;
    info!(
        host = %config.server.host,
        port = config.server.port,
        "Starting Pulse"
    );

    metrics::init_metrics();
    handlers::run_server(config).await
}

//! chunkd server binary.
//!
//! Binds the configured local socket and serves the example chunk
//! protocol (noop, echo, delay, compute, shutdown) until a `SHUT`
//! request drains the server.

use chunkd::config::Config;
use chunkd::handlers::HandlerTable;
use chunkd::runtime;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::load()?;

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        socket = %config.socket.display(),
        max_request_size = config.max_request_size,
        max_connections = config.max_connections,
        idle_timeout_secs = config.idle_timeout.as_secs(),
        "Starting chunkd server"
    );

    runtime::run(config, HandlerTable::builtin())?;
    Ok(())
}

//! Atelier server - main entry point.

use anyhow::Result;
use atelier_common::logging::init_logging;
use atelier_common::Config;
use atelier_server::start_server;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load_with_env()?;

    // Initialize logging
    init_logging(
        &config.observability.log_level,
        &config.observability.log_format,
    );

    tracing::info!("Atelier server v{}", env!("CARGO_PKG_VERSION"));

    // Start the HTTP/WS server
    start_server(config).await
}

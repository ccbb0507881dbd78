use log::*;
use reading_sync_rs::Fabric;
use service::{config::Config, logging::Logger};

#[tokio::main]
async fn main() {
    let config = Config::new();
    Logger::init_logger(&config as &Config);

    info!("Starting reading sync fabric v{}", env!("CARGO_PKG_VERSION"));
    debug!("{config:?}");

    let fabric = match Fabric::start(config).await {
        Ok(fabric) => fabric,
        Err(e) => {
            error!("Failed to start listeners: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutdown requested");

    fabric.shutdown().await;
}

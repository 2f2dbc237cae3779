// bin/relay.rs — the relay service binary.
//
// Grounded on the teacher's `main.rs`: `dotenvy::dotenv()` then
// `env_logger::init()`, environment-driven config, a live-vs-sim exchange
// client chosen at startup, then run until interrupted. Collapsed from the
// teacher's many inline `tokio::spawn` loops into one `RelayEngine::new`
// call since that's where this crate's component wiring now lives.

use std::sync::Arc;

use copy_relay::config::{RelayConfig, SignerConfig};
use copy_relay::engine::RelayEngine;
use copy_relay::gateway::{ExchangeClient, LiveGateway};
use copy_relay::repository::{Repository, SqliteRepository};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    env_logger::init();
    log::info!("copy-relay starting...");

    let config = RelayConfig::from_env();
    let signer_config = match SignerConfig::from_env() {
        Ok(c) => c,
        Err(e) => {
            log::error!("signer configuration error: {}", e);
            std::process::exit(1);
        }
    };

    let gateway: Arc<dyn ExchangeClient> = Arc::new(LiveGateway::new(config.gateway.clone()));

    let repository: Arc<dyn Repository> = match SqliteRepository::connect(&config.sqlite_path).await {
        Ok(repo) => Arc::new(repo),
        Err(e) => {
            log::error!("repository connect failed, cannot start: {}", e);
            std::process::exit(1);
        }
    };

    let engine = match RelayEngine::new(config, signer_config, gateway, repository).await {
        Ok(engine) => Arc::new(engine),
        Err(e) => {
            log::error!("engine startup failed: {}", e);
            std::process::exit(1);
        }
    };

    log::info!("copy-relay running. Following registered leaders, awaiting operator calls.");
    match tokio::signal::ctrl_c().await {
        Ok(()) => log::info!("shutdown signal received"),
        Err(e) => log::error!("failed to listen for shutdown signal: {}", e),
    }

    engine.shutdown().await;
    log::info!("copy-relay stopped.");
}

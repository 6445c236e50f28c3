//! OnAir relay: WebSocket fan-out and durable rundown store.
//!
//! ```text
//! ONAIR_BIND=0.0.0.0:9090 ONAIR_DATA_DIR=/var/lib/onair \
//!     onair-relay morning-show.json evening-news.json
//! ```
//!
//! Each argument is a rundown JSON file seeded into the store before the
//! relay starts accepting connections. `RUST_LOG` controls verbosity.

use std::path::PathBuf;
use std::sync::Arc;

use log::{error, info};
use onair_core::Rundown;
use onair_sync::{RelayServer, ServerConfig};

const DEFAULT_BIND: &str = "127.0.0.1:9090";
const DEFAULT_DATA_DIR: &str = "onair-data";

fn config_from_env() -> ServerConfig {
    let bind_addr = std::env::var("ONAIR_BIND").unwrap_or_else(|_| DEFAULT_BIND.to_string());
    let data_dir = std::env::var_os("ONAIR_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
    ServerConfig {
        bind_addr,
        storage_path: Some(data_dir),
        ..ServerConfig::default()
    }
}

fn seed(server: &RelayServer, files: &[String]) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    for file in files {
        let json = std::fs::read_to_string(file)?;
        let rundown = Rundown::from_json(&json)?;
        server.seed(&rundown)?;
        info!("Loaded {file}: '{}' with {} item(s)", rundown.name, rundown.item_count());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    env_logger::init();

    let config = config_from_env();
    info!(
        "Starting relay on {} (data: {:?})",
        config.bind_addr, config.storage_path
    );
    let server = Arc::new(RelayServer::new(config)?);

    let files: Vec<String> = std::env::args().skip(1).collect();
    if let Err(e) = seed(&server, &files) {
        error!("Seeding failed: {e}");
        return Err(e);
    }

    let stopper = server.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutting down");
            stopper.shutdown();
        }
    });

    server.run().await?;

    if let Some(store) = server.store() {
        store.sync()?;
    }
    let stats = server.stats().await;
    info!(
        "Served {} connection(s), {} message(s), {} persisted event(s)",
        stats.total_connections, stats.total_messages, stats.persisted_events
    );
    Ok(())
}

use chunklink_coordinator::{Cli, Coordinator};
use chunklink_core::Identity;
use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    let config = cli.config();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level)),
        )
        .init();

    let identity = match &cli.network_key {
        Some(key) => Identity::from_hex(key)?,
        None => {
            let identity = Identity::generate();
            warn!(
                "No --network-key given; generated ephemeral key {}. Nodes must be started with it.",
                identity.seed_hex()
            );
            identity
        }
    };
    info!("🔑 Network key id {}", identity.key_id());

    let mut coordinator = Coordinator::new(config.clone(), Arc::new(identity));
    coordinator.start(config.listen_addr).await?;

    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    // Status report interval
    let mut status_interval = time::interval(Duration::from_secs(30));

    loop {
        tokio::select! {
            result = &mut shutdown => {
                if let Err(e) = result {
                    warn!("Failed to listen for ctrl-c: {}", e);
                }
                break;
            }
            _ = status_interval.tick() => {
                let peers = coordinator.peers().await;
                let files = coordinator.file_list().await;
                info!(
                    "📊 {} connections, {} registered nodes, {} files",
                    coordinator.connection_count().await,
                    peers.len(),
                    files.len()
                );
            }
        }
    }

    info!("Shutting down coordinator");
    coordinator.stop().await;
    Ok(())
}

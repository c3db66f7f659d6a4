//! Collaborative Editing WebSocket Server
//! One session actor per document; clients speak JSON envelopes

use collaboration::{CollaborationConfig, FileSnapshotStore, SessionRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

mod connection;

const PRUNE_INTERVAL: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("collab_server=info,collaboration=info")),
        )
        .init();

    let addr = std::env::var("COLLAB_ADDR").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
    let snapshot_dir =
        std::env::var("COLLAB_SNAPSHOT_DIR").unwrap_or_else(|_| "./snapshots".to_string());

    let config = CollaborationConfig::from_env();
    let store = Arc::new(FileSnapshotStore::new(&snapshot_dir));
    let registry = Arc::new(SessionRegistry::new(store, config));

    let listener = TcpListener::bind(&addr).await?;
    info!(%addr, snapshots = %snapshot_dir, "collaboration server listening");

    let pruner = {
        let registry = registry.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(PRUNE_INTERVAL);
            loop {
                ticker.tick().await;
                let pruned = registry.prune().await;
                if pruned > 0 {
                    info!(pruned, "forgot stopped sessions");
                }
            }
        })
    };

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer_addr)) => {
                    tokio::spawn(connection::handle_connection(stream, peer_addr, registry.clone()));
                }
                Err(e) => error!("Failed to accept connection: {}", e),
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    pruner.abort();
    registry.shutdown().await;
    info!("all sessions saved, exiting");
    Ok(())
}

use std::sync::Arc;

use clap::Parser;
use netlens_server::{ConnectionHub, EventBridge, HubConfig};
use netlens_store::{RequestStore, StoreConfig};

/// Capture outbound network calls and stream them live to viewer clients.
#[derive(Parser, Debug)]
#[command(name = "netlens", version, about)]
struct Cli {
    /// Address to bind the viewer server on.
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port for the viewer server (0 picks a free port).
    #[arg(long, default_value_t = 9090)]
    port: u16,

    /// Maximum number of captured requests kept in memory.
    #[arg(long, default_value_t = 500)]
    capacity: usize,

    /// Byte cap applied to stored request/response bodies.
    #[arg(long, default_value_t = 256 * 1024)]
    max_body_size: usize,

    /// Per-viewer send queue depth.
    #[arg(long, default_value_t = 256)]
    send_queue: usize,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    tracing::info!("starting netlens");

    let store = Arc::new(RequestStore::new(StoreConfig {
        capacity: cli.capacity,
        max_body_size: cli.max_body_size,
    }));

    let hub = ConnectionHub::new(HubConfig {
        host: cli.host,
        port: cli.port,
        max_send_queue: cli.send_queue,
    });
    let events = hub.subscribe();

    let bridge = Arc::new(EventBridge::new(Arc::clone(&store), hub.registry()));
    tokio::spawn(Arc::clone(&bridge).run(events));

    let port = match hub.start().await {
        Ok(port) => port,
        Err(e) => {
            tracing::error!(error = %e, "failed to start the viewer server");
            std::process::exit(1);
        }
    };
    bridge.start();

    tracing::info!(port, capacity = cli.capacity, "netlens ready");

    tokio::signal::ctrl_c()
        .await
        .expect("failed to listen for ctrl+c");

    tracing::info!("shutting down");
    bridge.stop();
    hub.stop().await;
}

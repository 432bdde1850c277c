//! Relay server: rooms of two peers exchanging offers, answers and ICE
//! candidates over WebSocket.
//!
//! ```bash
//! PORT=5000 rendezvous-server
//! rendezvous-server --host 127.0.0.1 --port 8080 --prune-empty-rooms
//! rendezvous-server --sweep-interval 300
//! ```

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use rendezvous::config::{ServerConfig, DEFAULT_QUEUE_DEPTH};
use rendezvous::{EmptyRoomPolicy, SignalingServer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "rendezvous-server", version, about = "WebRTC signaling relay", long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0", env = "HOST")]
    host: IpAddr,

    /// Port to listen on
    #[arg(short, long, default_value_t = 5000, env = "PORT")]
    port: u16,

    /// Outbound frames queued per connection before new ones are dropped
    #[arg(long, default_value_t = DEFAULT_QUEUE_DEPTH)]
    queue_depth: usize,

    /// Forget a room as soon as its last member disconnects
    #[arg(long)]
    prune_empty_rooms: bool,

    /// Forget empty rooms every N seconds
    #[arg(long, value_name = "SECS")]
    sweep_interval: Option<u64>,
}

impl Args {
    fn into_config(self) -> ServerConfig {
        ServerConfig {
            bind_address: SocketAddr::new(self.host, self.port),
            queue_depth: self.queue_depth,
            empty_rooms: if self.prune_empty_rooms {
                EmptyRoomPolicy::Remove
            } else {
                EmptyRoomPolicy::Retain
            },
            sweep_interval: self.sweep_interval.map(Duration::from_secs),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Args::parse().into_config();
    let server = SignalingServer::bind(config.clone())
        .await
        .with_context(|| format!("failed to bind {}", config.bind_address))?;
    info!("Server running on port {}", server.local_addr()?.port());

    tokio::select! {
        result = server.serve() => result.context("signaling server stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Shutting down"),
    }
    Ok(())
}

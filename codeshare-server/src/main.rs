//! codeshare-server — session server for the collaborative editor.
//!
//! Browsers connect over WebSocket, join a named session and exchange edit
//! batches and cursor moves through it. Logging follows `RUST_LOG`, with
//! `info` (or `debug` under `--verbose`) as the default filter.

use std::time::Duration;

use clap::Parser;
use codeshare_collab::{ServerConfig, ServerError, SyncServer};
use log::info;

#[derive(Parser, Debug)]
#[command(name = "codeshare-server")]
#[command(about = "Real-time collaborative editing session server")]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:9090")]
    listen: String,

    /// Maximum members per session
    #[arg(long, default_value_t = 100)]
    max_peers: usize,

    /// Events buffered per connection before it is resynchronized
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// Seconds between checksum heartbeats
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

impl Args {
    fn server_config(&self) -> ServerConfig {
        ServerConfig {
            bind_addr: self.listen.clone(),
            max_peers_per_room: self.max_peers,
            broadcast_capacity: self.broadcast_capacity,
            heartbeat_interval: Duration::from_secs(self.heartbeat_secs.max(1)),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), ServerError> {
    let args = Args::parse();

    let default_filter = if args.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let server = SyncServer::new(args.server_config());
    info!(
        "Starting codeshare-server on {} (max {} peers per session)",
        server.bind_addr(),
        server.config().max_peers_per_room
    );

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} batches applied",
                stats.total_connections, stats.applied_batches
            );
            Ok(())
        }
    }
}

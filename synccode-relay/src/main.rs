//! SyncCode relay: forwards room traffic between paired participants.
//!
//! Holds no document state. Each room admits `--capacity` participants;
//! everyone after that is told the room is full and disconnected.

use clap::Parser;
use log::{info, warn};

use synccode_collab::{RelayConfig, SyncServer};

#[derive(Debug, Parser)]
#[command(name = "synccode-relay", version, about = "Signaling relay for SyncCode rooms")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:9090")]
    bind: String,

    /// Maximum participants per room
    #[arg(long, default_value_t = 2)]
    capacity: usize,

    /// Per-room broadcast buffer
    #[arg(long, default_value_t = 256)]
    broadcast_capacity: usize,

    /// WebSocket ping interval
    #[arg(long, default_value_t = 30)]
    heartbeat_secs: u64,

    /// Drop connections silent for this long
    #[arg(long, default_value_t = 90)]
    liveness_secs: u64,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(short, long)]
    verbose: bool,
}

impl From<&Cli> for RelayConfig {
    fn from(cli: &Cli) -> Self {
        let heartbeat = cli.heartbeat_secs.max(1);
        // A connection must get at least one ping before it can be dropped.
        let min_liveness = heartbeat.saturating_add(1);
        if cli.liveness_secs < min_liveness {
            warn!(
                "--liveness-secs {} is not above --heartbeat-secs {heartbeat}, using {min_liveness}",
                cli.liveness_secs
            );
        }
        Self {
            bind_addr: cli.bind.clone(),
            room_capacity: cli.capacity.max(1),
            broadcast_capacity: cli.broadcast_capacity.max(1),
            heartbeat_interval_secs: heartbeat,
            liveness_timeout_secs: cli.liveness_secs.max(min_liveness),
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_filter)).init();

    let config = RelayConfig::from(&cli);
    info!("SyncCode relay starting");

    let server = SyncServer::new(config);
    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            let stats = server.stats().await;
            info!(
                "Shutting down: {} connections served, {} joins rejected",
                stats.total_connections, stats.rejected_joins
            );
            Ok(())
        }
    }
}

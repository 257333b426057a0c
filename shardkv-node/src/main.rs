//! shardkv node
//!
//! Runs one replica: serves clients on `/ws` and peers on `/sync`.
//!
//! # Usage
//!
//! ```bash
//! # Three local replicas
//! shardkv-node --addr 127.0.0.1:8080
//! shardkv-node --addr 127.0.0.1:8081 --peer 127.0.0.1:8080
//! shardkv-node --addr 127.0.0.1:8082 --peer 127.0.0.1:8080 --peer 127.0.0.1:8081
//! ```

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use shardkv_core::config::snapshot_file_name;
use shardkv_core::{Node, NodeConfig};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Replicated last-writer-wins key-value node
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(short, long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// Address peers use to reach this node (defaults to the bound address)
    #[arg(long)]
    advertise: Option<String>,

    /// Peer addresses known at startup (can be repeated)
    #[arg(long)]
    peer: Vec<String>,

    /// Number of store shards
    #[arg(long, default_value = "32")]
    shards: usize,

    /// Directory for snapshot files
    #[arg(long, default_value = ".")]
    data_dir: PathBuf,

    /// Seconds between snapshots
    #[arg(long, default_value = "2")]
    snapshot_secs: u64,

    /// Disable snapshot persistence
    #[arg(long)]
    no_persist: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("shardkv node starting on {}", args.addr);

    let mut config = NodeConfig::new(&args.addr).with_shards(args.shards);
    if let Some(advertise) = &args.advertise {
        config = config.with_advertise(advertise);
    }
    for peer in &args.peer {
        config = config.with_peer(peer);
    }
    if !args.no_persist {
        config = config
            .with_snapshot(args.data_dir.join(snapshot_file_name(&args.addr)))
            .with_snapshot_interval(Duration::from_secs(args.snapshot_secs));
    }

    let node = Node::start(config).await?;
    info!("Serving as {}", node.address());

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    node.shutdown()?;

    Ok(())
}

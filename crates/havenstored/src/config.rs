//! Configuration for havenstored

use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;

/// havenstored - HavenMesh replicated data store daemon
#[derive(Parser, Debug, Clone)]
#[command(name = "havenstored")]
#[command(about = "HavenMesh replicated data store and gossip daemon")]
pub struct Config {
    /// Listen address for peer connections
    #[arg(short, long, default_value = "0.0.0.0:9040")]
    pub listen: SocketAddr,

    /// Data directory for persistent storage
    #[arg(short, long, default_value = "./data/havenstored")]
    pub data_dir: PathBuf,

    /// Bootstrap peers (comma-separated addresses)
    #[arg(long, value_delimiter = ',')]
    pub bootstrap: Vec<SocketAddr>,

    /// Maximum items per inventory response
    #[arg(long, default_value = "10000")]
    pub max_inventory_items: u32,

    /// Per-peer broadcast send timeout in seconds
    #[arg(long, default_value = "5")]
    pub broadcast_timeout_secs: u64,

    /// Inventory round timeout in seconds
    #[arg(long, default_value = "30")]
    pub inventory_timeout_secs: u64,

    /// Interval between expired-record prune cycles in seconds
    #[arg(long, default_value = "600")]
    pub prune_interval_secs: u64,

    /// Interval between store snapshots to disk in seconds
    #[arg(long, default_value = "300")]
    pub snapshot_interval_secs: u64,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty")]
    pub log_format: String,
}

impl Config {
    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_inventory_items == 0 {
            anyhow::bail!("max_inventory_items must be at least 1");
        }
        if self.prune_interval_secs == 0 || self.snapshot_interval_secs == 0 {
            anyhow::bail!("prune and snapshot intervals must be non-zero");
        }
        if self.log_format != "json" && self.log_format != "pretty" {
            anyhow::bail!("log_format must be 'json' or 'pretty'");
        }
        Ok(())
    }
}

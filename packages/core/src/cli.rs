use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;

/// Clinical edge engine CLI arguments. Flags override the environment.
#[derive(Debug, Parser)]
#[command(
    name = "clinical-edge",
    version,
    about = "Offline-first task scheduling and record sync for clinical capture devices"
)]
pub struct Cli {
    /// SQLite database URL (e.g. sqlite://clinical-edge.db)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Base URL of the remote sync endpoint
    #[arg(long)]
    pub remote_url: Option<String>,

    /// Run without a remote endpoint, even if one is configured
    #[arg(long, conflicts_with = "remote_url")]
    pub offline: bool,

    /// Number of parallel worker lanes
    #[arg(long)]
    pub workers: Option<usize>,

    /// Maximum number of queued tasks before submissions are rejected
    #[arg(long)]
    pub queue_limit: Option<usize>,

    /// Directory holding model manifests
    #[arg(long)]
    pub model_dir: Option<PathBuf>,

    /// Address for the local HTTP ingress
    #[arg(long)]
    pub listen: Option<SocketAddr>,
}

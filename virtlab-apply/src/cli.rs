//! Command-line argument parsing.

use clap::Parser;

/// virtlab apply - Reconcile a libvirt host against a lab topology
#[derive(Parser, Debug, Default)]
#[command(name = "virtlab-apply")]
#[command(about = "virtlab apply - Reconcile a libvirt host against a lab topology")]
#[command(version)]
pub struct Args {
    /// Topology file (YAML, or JSON with a .json extension)
    pub topology: String,

    /// Path to configuration file (optional, defaults used if not found)
    #[arg(short, long)]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    pub log_level: Option<String>,

    /// Emit logs as JSON
    #[arg(long)]
    pub log_json: bool,

    /// Libvirt connection URI (e.g., qemu:///system)
    #[arg(long, env = "VIRTLAB_LIBVIRT_URI")]
    pub libvirt_uri: Option<String>,

    /// Maximum number of networks/pools reconciled at once
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Enable development mode (in-memory mock hypervisor)
    #[arg(long)]
    pub dev: bool,
}

use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(
    name = "kup",
    version,
    about = "Activates a development container: syncs your files, forwards ports and runs your command."
)]
pub struct CliArgs {
    /// Path to the manifest file
    #[arg(short, long)]
    pub file: Option<PathBuf>,

    /// Namespace where the development container runs
    #[arg(short, long)]
    pub namespace: Option<String>,

    /// Kubeconfig context to use
    #[arg(short, long)]
    pub context: Option<String>,

    /// Create a sandbox workload without asking when none exists
    #[arg(short, long)]
    pub deploy: bool,

    /// Reset the file synchronization database
    #[arg(long)]
    pub reset: bool,

    /// Directory for state, logs and sync daemon files
    #[arg(long, env = "KUP_HOME")]
    pub home: Option<PathBuf>,

    /// tracing filter (for example: info,debug,trace)
    #[arg(long, default_value = "info")]
    pub log_filter: String,
}

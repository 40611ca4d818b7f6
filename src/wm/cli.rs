use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use crate::wm::build_info;

/// Daemon command line.
#[derive(Debug, Parser)]
#[command(
    name = "workermaster",
    version,
    long_version = build_info::long_version(),
    about = "Supervises a bounded pool of per-target analysis workers"
)]
pub struct Args {
    /// Path to the config YAML (default: ./workermaster.yaml when present)
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Log level or filter directive; overrides the config file
    #[arg(long = "log-level")]
    pub log_level: Option<String>,
}

/// `wmctl` command line.
#[derive(Debug, Parser)]
#[command(
    name = "wmctl",
    version,
    long_version = build_info::long_version(),
    about = "workermaster control client"
)]
pub struct CtlArgs {
    /// Path to the config YAML shared with the daemon
    #[arg(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Daemon binary to launch on `start` (default: `workermaster` next to wmctl, then $PATH)
    #[arg(long = "daemon-bin", env = "WM_DAEMON_BIN")]
    pub daemon_bin: Option<PathBuf>,

    #[command(subcommand)]
    pub cmd: Option<Cmd>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Cmd {
    /// Start the daemon unless it is already answering
    Start,
    /// Stop the daemon and all of its workers
    Stop,
    /// Stop, pause, start
    Restart,
    /// Show whether the daemon runs, and its workers (default)
    Status {
        /// Output format: text (default) or json
        #[arg(long = "format", default_value = "text")]
        format: OutputFormat,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

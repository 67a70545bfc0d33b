//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

use swarmdl_core::{DEFAULT_MAX_RETRIES, RuntimeFlavor};

/// Runtime selector accepted on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigArg {
    /// Multi-threaded runtime for real downloads.
    Production,
    /// Single-threaded runtime with deterministic cooperative scheduling.
    Testing,
}

impl From<ConfigArg> for RuntimeFlavor {
    fn from(value: ConfigArg) -> Self {
        match value {
            ConfigArg::Production => Self::Production,
            ConfigArg::Testing => Self::Testing,
        }
    }
}

/// Federate list downloads across a pool of mirror servers.
///
/// Without --servers, swarmdl runs a simulated mirror pool over a generated
/// request list and prints the result and failure tables plus a summary.
#[derive(Parser, Debug)]
#[command(name = "swarmdl")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Number of requests to generate
    #[arg(short = 'n', long, default_value_t = 100)]
    pub requests: usize,

    /// Number of simulated mirror workers (ignored with --servers)
    #[arg(short = 'w', long, default_value_t = 3)]
    pub workers: usize,

    /// Maximum retries for transient failures (0 re-queues without limit)
    #[arg(short = 'r', long, default_value_t = DEFAULT_MAX_RETRIES)]
    pub max_retries: u32,

    /// Runtime configuration to start
    #[arg(long, value_enum, default_value_t = ConfigArg::Production)]
    pub config: ConfigArg,

    /// JSON file with an array of mirror server definitions
    #[arg(long)]
    pub servers: Option<PathBuf>,

    /// Directory downloaded payloads are written under
    #[arg(short = 'o', long)]
    pub output_dir: Option<PathBuf>,

    /// Rolling-average window for diagnostic statistics
    #[arg(long, default_value_t = 0)]
    pub history_len: usize,

    /// File-type suffix for generated request codes
    #[arg(long, default_value = "txt")]
    pub file_type: String,
}

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod approval;
mod completion;
mod config;
mod dispatch;
mod render;

use completion::CliCompletionShell;
use dispatch::run_cli;

const LOG_ENV: &str = "UPKEEP_LOG";

#[derive(Parser, Debug)]
#[command(name = "upkeep")]
#[command(about = "Self-upgrade manager with backup and automatic rollback", long_about = None)]
struct Cli {
    /// Configuration file (defaults to ~/.upkeep/upkeep.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    watch_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    install_dir: Option<PathBuf>,
    #[arg(long, global = true)]
    state_dir: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show the installation, backup slot, pending artifact and last install.
    Status,
    /// Run one upgrade attempt now.
    Trigger {
        /// Upgrade from this artifact instead of the newest one in the watch dir.
        #[arg(long)]
        artifact: Option<PathBuf>,
    },
    /// Poll the watch directory and upgrade whenever a new artifact appears.
    Watch {
        /// Seconds between polls; overrides `[watch] interval_secs`.
        #[arg(long)]
        interval: Option<u64>,
        /// Stop after this many polls.
        #[arg(long)]
        cycles: Option<u64>,
        /// Delete artifacts that installed successfully.
        #[arg(long, conflicts_with = "move_to")]
        cleanup: bool,
        /// Move artifacts that installed successfully into this directory.
        #[arg(long)]
        move_to: Option<PathBuf>,
    },
    /// List what an upgrade would add or change, without applying it.
    Preview {
        #[arg(long)]
        artifact: Option<PathBuf>,
    },
    /// Print recent audit records.
    History {
        #[arg(short = 'n', long = "limit", default_value_t = 20)]
        limit: usize,
    },
    /// Delete a consumed artifact and its signature sidecar.
    Cleanup { path: PathBuf },
    /// Restore the installation from the backup slot.
    Rollback,
    Completions {
        #[arg(value_enum)]
        shell: Option<CliCompletionShell>,
    },
    Version,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging();
    run_cli(cli)
}

fn init_logging() {
    let default_level = "warn";
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env(LOG_ENV)
                .or_else(|_| EnvFilter::try_new(default_level))
                .unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod completion;
mod dispatch;
mod render;

use completion::CliCompletionShell;

#[derive(Parser, Debug)]
#[command(name = "verkeep")]
#[command(about = "Versioned install, upgrade and rollback of host runtime components", long_about = None)]
struct Cli {
    /// Host configuration file.
    #[arg(long, env = "VERKEEP_CONFIG", global = true)]
    config: Option<PathBuf>,
    /// Raise log verbosity (-v info, -vv debug); `VERKEEP_LOG` overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Install a component; defaults to its configured version.
    Install {
        component: String,
        version: Option<String>,
        /// Replace an existing installation.
        #[arg(long)]
        force: bool,
    },
    /// Upgrade one component, or every component to its configured version.
    Upgrade {
        component: Option<String>,
        #[arg(requires = "component")]
        version: Option<String>,
    },
    /// Roll back one component, or every installed component with a recorded prior version.
    Rollback {
        component: Option<String>,
        #[arg(long = "to", requires = "component")]
        to: Option<String>,
    },
    Uninstall {
        component: String,
    },
    Status {
        #[arg(long)]
        json: bool,
    },
    /// Delete backups no longer referenced by the ledger.
    Prune {
        component: Option<String>,
    },
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
    Completions {
        #[arg(value_enum)]
        shell: CliCompletionShell,
    },
    Version,
}

#[derive(Subcommand, Debug)]
enum LedgerCommands {
    /// Replace an unreadable ledger with an empty one.
    Reset {
        #[arg(long)]
        confirm: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dispatch::run_cli(cli)
}

fn init_logging(verbosity: u8) {
    let filter = EnvFilter::try_from_env("VERKEEP_LOG")
        .unwrap_or_else(|_| EnvFilter::new(default_log_level(verbosity)));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn default_log_level(verbosity: u8) -> &'static str {
    match verbosity {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

#[cfg(test)]
mod tests;

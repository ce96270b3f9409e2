use std::path::PathBuf;
use std::time::Duration;

use clap::{ArgAction, Args, Parser, Subcommand};

use cb_core::models::RunOptions;
use cb_core::services::config_loader::DEFAULT_INVENTORY_FILENAME;

pub const DEFAULT_STATE_DIR: &str = ".clusterboot";

#[derive(Parser, Debug)]
#[command(name = "clusterboot")]
#[command(about = "Bootstrap a kubeadm cluster over SSH, one idempotent step at a time")]
#[command(version)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug)]
pub struct GlobalArgs {
    /// Inventory file describing the cluster and its hosts
    #[arg(short, long, global = true, default_value = DEFAULT_INVENTORY_FILENAME)]
    pub inventory: PathBuf,

    /// YAML step file replacing the built-in bootstrap catalog
    #[arg(long, global = true)]
    pub steps: Option<PathBuf>,

    /// Directory holding the execution records
    #[arg(long, global = true, default_value = DEFAULT_STATE_DIR)]
    pub state_dir: PathBuf,

    /// Login user for hosts that do not name one
    #[arg(long, global = true)]
    pub ssh_user: Option<String>,

    /// Private key for hosts that do not name one
    #[arg(long, global = true)]
    pub identity_file: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, global = true, action = ArgAction::Count)]
    pub verbose: u8,

    /// Write logs to this file instead of stderr
    #[arg(long, global = true)]
    pub log_file: Option<PathBuf>,

    /// Print machine-readable JSON instead of tables
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the selected phases (all of them by default)
    Run(RunArgs),
    /// List the (phase, host, step) triples a run would visit
    Plan(SelectionArgs),
    /// Show recorded step status
    Status(SelectionArgs),
    /// Forget recorded progress so steps run again
    Reset(ResetArgs),
    /// Check that every host accepts SSH connections
    Probe,
}

#[derive(Args, Debug, Default)]
pub struct SelectionArgs {
    /// Phase to run; repeat for several
    #[arg(short, long = "phase")]
    pub phases: Vec<String>,

    /// Restrict to this host id or address; repeat for several
    #[arg(long = "host")]
    pub hosts: Vec<String>,
}

#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub selection: SelectionArgs,

    /// Re-verify steps already recorded as successful
    #[arg(long)]
    pub force: bool,

    /// Extra attempts for a failing step
    #[arg(long, default_value_t = 0)]
    pub retries: u32,

    #[arg(long, default_value_t = 5)]
    pub retry_delay_secs: u64,

    /// Default per-step timeout; steps may declare their own
    #[arg(long, default_value_t = 600)]
    pub step_timeout_secs: u64,

    /// Hosts processed at once (default: all)
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Reset workers left half-joined by an earlier failure, then rejoin them
    #[arg(long)]
    pub reset_partial_joins: bool,
}

impl RunArgs {
    pub fn options(&self) -> RunOptions {
        RunOptions {
            force: self.force,
            max_parallel: self.max_parallel,
            step_timeout: Duration::from_secs(self.step_timeout_secs),
            retries: self.retries,
            retry_delay: Duration::from_secs(self.retry_delay_secs),
            reset_partial_joins: self.reset_partial_joins,
        }
    }
}

#[derive(Args, Debug)]
pub struct ResetArgs {
    /// Host to reset; repeat for several (default: all)
    #[arg(long = "host")]
    pub hosts: Vec<String>,

    /// Only forget this step
    #[arg(long)]
    pub step: Option<String>,

    /// Also wipe cluster membership on workers (kubeadm reset)
    #[arg(long)]
    pub remote: bool,

    #[arg(long, default_value_t = 300)]
    pub timeout_secs: u64,
}

/// Default filter directive when `RUST_LOG` is unset.
pub fn log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

use clap::Parser;

use crate::settings::SigMode;

const CMD_NAME: &str = "sos";
const DEFAULT_SCRIPT: &str = "workflow.sos";
const DEFAULT_WORKDIR: &str = ".";

/// Stores our command-line args format.
#[derive(Parser, Debug, Clone)]
#[command(name = CMD_NAME, version, about = None, long_about = None)]
pub struct Args {
    /// Workflow script
    #[arg(value_name = "SCRIPT", default_value = DEFAULT_SCRIPT)]
    #[arg(env = "SOS_SCRIPT")]
    pub script: String,

    /// Name of the workflow to run
    #[arg(short, long, value_name = "NAME")]
    pub workflow: Option<String>,

    /// Only run what is needed for these targets ('@step' for a step)
    #[arg(short, long = "target", value_name = "TARGET")]
    pub targets: Vec<String>,

    /// Directory to run steps in
    #[arg(short = 'd', long, value_name = "DIR", default_value = DEFAULT_WORKDIR)]
    #[arg(env = "SOS_WORKDIR")]
    pub workdir: String,

    /// Maximum number of concurrently running steps
    #[arg(short = 'j', long, value_name = "N", default_value_t = 4)]
    #[arg(env = "SOS_MAX_PROCS")]
    pub max_procs: usize,

    /// Signature mode
    #[arg(short, long, value_enum, default_value_t = SigMode::Default)]
    pub sig_mode: SigMode,

    /// Dry run; don't run step bodies
    #[arg(short = 'n', long)]
    pub dryrun: bool,

    /// Keep waiting for offloaded tasks (default: ask the host)
    #[arg(long, value_name = "BOOL")]
    pub wait_for_task: Option<bool>,

    /// Resume a run that exited with pending tasks
    #[arg(short, long)]
    pub resume: bool,

    /// Config file handed to step evaluators
    #[arg(short, long, value_name = "FILE")]
    pub config: Option<String>,

    /// Write dag snapshots to this file
    #[arg(long, value_name = "FILE")]
    pub dag: Option<String>,

    /// Write the run report to this file
    #[arg(long, value_name = "FILE")]
    pub report: Option<String>,

    /// Seconds to wait for task results
    #[arg(long, value_name = "SECS", default_value_t = 60)]
    pub download_timeout: u64,

    /// Verbosity, 0 (errors only) to 4 (trace)
    #[arg(short, long, value_name = "LEVEL", default_value_t = 2)]
    #[arg(value_parser = clap::value_parser!(u8).range(0..=4))]
    pub verbosity: u8,

    /// Fingerprint of an enclosing workflow
    #[arg(long, value_name = "ID", hide = true)]
    pub master_id: Option<String>,
}

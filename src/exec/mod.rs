/// Messages between the orchestrator and workers
mod message;

/// Offloaded tasks and the hosts that run them
mod tasks;
pub use tasks::{Hosts, TaskHost, TaskResult, TaskSpec, TaskStatus};

/// Run a subprocess
mod run_cmd;
pub use run_cmd::ProcessGroups;

/// Target checks against the current run
mod env;
pub use env::RunEnv;

/// Step signatures and locks
mod signature;
pub use signature::SignatureStore;

/// The step evaluation seam
mod evaluator;
pub use evaluator::{StepContext, StepError, StepEvaluator, StepOutput};

/// Runs step bodies with bash
mod shell;
pub use shell::ShellEvaluator;

/// Runs tasks on this machine
mod host;
pub use host::LocalHost;

/// Collects step errors and classifies run failures
mod errors;
pub use errors::ErrorKind;

/// Graph bookkeeping shared by top-level and nested workflows
mod scheduler;
pub use scheduler::Scheduler;

/// Worker threads
mod worker;
pub use worker::{WorkerCtx, WorkerEnv};

mod pool;

/// The executor loop
mod orchestrator;
pub use orchestrator::{install_interrupt_handler, Orchestrator, Outcome};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Expected output {0} not found after step \"{1}\"")]
    ExpectedOutputMissing(String, String),
    #[error("Step \"{0}\" failed with {1}; see {2}")]
    SubprocessFailed(String, String, String),
    #[error("Unknown task status \"{0}\"")]
    UnknownTaskStatus(String),
    #[error("Unknown task host \"{0}\"")]
    UnknownHost(String),
    #[error("Unable to capture child {0}")]
    ChildPipe(&'static str),
    #[error("Interrupted")]
    Interrupted,
    #[error("Interrupted after {0} errors")]
    InterruptedAfterFailure(usize),
}

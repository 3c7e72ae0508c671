use workflow::{ExistKind, Namespace, StepDescriptor, Target};

use super::env::RunEnv;
use super::message::{Counters, StepJob};
use super::run_cmd::ProcessGroups;
use super::worker::WorkerCtx;
use crate::fs::Fs;
use crate::settings::RunConfig;

/// Ways a step evaluation can stop short of completing.
#[derive(Debug, thiserror::Error)]
pub enum StepError {
    /// the step needs a target that nothing has produced
    #[error("Unknown target {0}")]
    UnknownTarget(Target),
    /// the step needs a target that was produced once, but is gone now
    #[error("Removed target {0}")]
    RemovedTarget(Target),
    #[error("{0}")]
    Failed(String),
    #[error("Interrupted")]
    Interrupted,
}

impl From<anyhow::Error> for StepError {
    fn from(e: anyhow::Error) -> Self {
        Self::Failed(format!("{e:#}"))
    }
}

/// What a completed evaluation hands back.
#[derive(Debug, Clone, Default)]
pub struct StepOutput {
    /// concrete outputs, for a step whose outputs were undetermined
    pub outputs: Option<Vec<Target>>,
    /// variable updates for later steps
    pub shared: Namespace,
    /// steps run by nested workflows
    pub counters: Counters,
}

/// Everything an evaluator can look at while running one step.
pub struct StepContext<'a> {
    pub step: &'a StepDescriptor,
    pub job: &'a StepJob,
    pub env: &'a RunEnv,
    pub fs: &'a Fs,
    pub config: &'a RunConfig,
    pub groups: &'a ProcessGroups,
}

impl StepContext<'_> {
    /// Fail with `UnknownTarget` (or `RemovedTarget`, if the target was
    /// produced before) on the first input file that doesn't exist.
    pub fn check_inputs(&self) -> Result<(), StepError> {
        for target in self.job.inputs.targets().iter().filter(|t| t.is_file()) {
            if target.exists(ExistKind::Target, self.env)? {
                continue;
            }
            log::debug!("{}: input {target} is missing", self.job.label);
            if target.exists(ExistKind::Signature, self.env)? {
                return Err(StepError::RemovedTarget(target.clone()));
            }
            return Err(StepError::UnknownTarget(target.clone()));
        }
        Ok(())
    }
}

/// Runs step bodies on a worker.
pub trait StepEvaluator: Send + Sync {
    fn evaluate(&self, cx: &StepContext, ctx: &mut WorkerCtx) -> Result<StepOutput, StepError>;
}

use std::collections::{BTreeMap, BTreeSet};
use std::ops::AddAssign;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use workflow::{Namespace, StepId, Target, TargetSet};

use super::tasks::TaskResult;

/// Completed and skipped steps, substeps, and tasks.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counters {
    pub step_completed: u64,
    pub step_skipped: u64,
    pub substep_completed: u64,
    pub substep_skipped: u64,
    pub task_completed: u64,
    pub task_skipped: u64,
}

impl AddAssign for Counters {
    fn add_assign(&mut self, other: Self) {
        self.step_completed += other.step_completed;
        self.step_skipped += other.step_skipped;
        self.substep_completed += other.substep_completed;
        self.substep_skipped += other.substep_skipped;
        self.task_completed += other.task_completed;
        self.task_skipped += other.task_skipped;
    }
}

impl Counters {
    /// Count one step (or substep) as completed or skipped.
    pub fn count(&mut self, substep: bool, skipped: bool) {
        match (substep, skipped) {
            (false, false) => self.step_completed += 1,
            (false, true) => self.step_skipped += 1,
            (true, false) => self.substep_completed += 1,
            (true, true) => self.substep_skipped += 1,
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, u64> {
        BTreeMap::from([
            ("step_completed".to_owned(), self.step_completed),
            ("step_skipped".to_owned(), self.step_skipped),
            ("substep_completed".to_owned(), self.substep_completed),
            ("substep_skipped".to_owned(), self.substep_skipped),
            ("task_completed".to_owned(), self.task_completed),
            ("task_skipped".to_owned(), self.task_skipped),
        ])
    }
}

/// Everything a worker needs to run one node.
#[derive(Debug, Clone)]
pub struct StepJob {
    pub step: StepId,
    /// node label, for messages
    pub label: String,
    /// unique file stem for the step's logs and signature
    pub stem: String,
    pub inputs: TargetSet,
    pub depends: TargetSet,
    pub outputs: TargetSet,
    /// snapshot of the variables the step reads
    pub vars: Namespace,
    pub signature_vars: BTreeSet<String>,
}

/// A nested workflow requested by a step.
#[derive(Debug, Clone)]
pub struct WorkflowJob {
    pub name: String,
    pub targets: Vec<Target>,
    /// variables seeded into the nested namespace
    pub shared: Namespace,
}

/// What a step gives back when it finishes.
#[derive(Debug, Clone, Default)]
pub struct StepResult {
    /// concrete outputs, if they were undetermined before the step ran
    pub outputs: Option<TargetSet>,
    pub shared: Namespace,
    pub counters: Counters,
    pub skipped: bool,
    /// dry-run stand-ins for outputs, removed at the end of the run
    pub placeholders: Vec<PathBuf>,
}

/// Outcome of running a step.
#[derive(Debug, Clone)]
pub enum StepReply {
    Done(StepResult),
    /// the step needs a target nothing produces yet
    Need(Target),
    /// the step needs a target that was removed and must be made again
    Regen(Target),
    /// another process holds the lock on an output
    Locked { output: Target, sig: PathBuf },
    Failed(String),
}

/// Outcome of a nested workflow.
#[derive(Debug, Clone, Default)]
pub struct WorkflowResult {
    pub workflow_id: u64,
    pub counters: Counters,
    /// variables the nested workflow changed
    pub shared: Namespace,
    /// summary of the nested workflow's errors, if it failed
    pub error: Option<String>,
}

/// Orchestrator -> worker.
#[derive(Debug)]
pub enum Work {
    Step(Box<StepJob>),
    Workflow { id: u64, job: Box<WorkflowJob> },
    /// results of the tasks the worker is waiting on
    Tasks(Result<Vec<TaskResult>, String>),
    /// result of a step the worker asked for
    Substep { sub_id: u64, reply: StepReply },
    /// result of the nested workflow the worker asked for
    WorkflowDone(WorkflowResult),
    Stop,
}

/// Worker -> orchestrator.
#[derive(Debug)]
pub enum Reply {
    /// the worker is blocked on these offloaded tasks
    Tasks { host: String, ids: Vec<String> },
    /// a nested workflow on the worker wants this step run
    Substep { sub_id: u64, job: Box<StepJob> },
    /// the step on the worker wants this workflow run
    Workflow(Box<WorkflowJob>),
    Step(StepReply),
    WorkflowDone(WorkflowResult),
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_counters() {
        let mut a = Counters::default();
        a.count(false, false);
        a.count(true, true);
        let mut b = Counters::default();
        b.count(false, false);
        b.task_completed = 2;
        a += b;
        assert_eq!(2, a.step_completed);
        assert_eq!(1, a.substep_skipped);
        assert_eq!(Some(&2), a.to_map().get("task_completed"));
    }
}

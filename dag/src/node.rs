use std::collections::BTreeSet;
use std::fmt;

use uuid::Uuid;
use workflow::{Namespace, StepId, Target, TargetSet};

util::id!(
    /// Index of a node in its [`Dag`](crate::Dag).
    NodeId,
    u32
);

/// Run state of a node.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    /// not started (or reset for another attempt)
    #[default]
    Waiting,
    Running,
    Completed,
    Failed,
    /// the step's worker is blocked on offloaded tasks
    TaskPending,
    /// waiting for another process to release an output lock
    SignaturePending,
    /// the step's worker is blocked on a nested workflow
    WorkflowPending,
    /// the node is running a nested workflow on behalf of another worker
    WorkflowRunningPending,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "none",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::TaskPending => "task_pending",
            Self::SignaturePending => "signature_pending",
            Self::WorkflowPending => "workflow_pending",
            Self::WorkflowRunningPending => "workflow_running_pending",
        }
    }

    /// Any of the `*_pending` states.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            Self::TaskPending
                | Self::SignaturePending
                | Self::WorkflowPending
                | Self::WorkflowRunningPending
        )
    }

    /// Completed or failed.
    pub fn is_done(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Variables forwarded to the worker that runs a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    pub signature_vars: BTreeSet<String>,
    pub environ_vars: BTreeSet<String>,
    pub changed_vars: BTreeSet<String>,
    /// pattern bindings, plus shared updates from predecessors
    pub vars: Namespace,
    /// targets this node was added to produce
    pub default_output: Vec<Target>,
}

/// One step instance in the graph.
#[derive(Debug, Clone)]
pub struct Node {
    pub id: NodeId,
    pub step: StepId,
    pub step_uuid: Uuid,
    pub name: String,
    pub index: Option<u32>,
    pub inputs: TargetSet,
    pub depends: TargetSet,
    pub outputs: TargetSet,
    pub context: Context,
    pub status: Status,
    /// ids of offloaded tasks the step is waiting on
    pub pending_tasks: Vec<String>,
    /// host the pending tasks were sent to
    pub host: Option<String>,
    /// nested workflow the step is waiting on
    pub pending_workflow: Option<u64>,
    /// the node was forwarded from a nested workflow
    pub from_nested: bool,
}

impl Node {
    /// Every target the node produces: declared outputs, the targets it was
    /// added for, the variables it shares, and its own step target.
    pub fn produced(&self) -> impl Iterator<Item = Target> + '_ {
        self.outputs
            .targets()
            .iter()
            .chain(self.context.default_output.iter())
            .cloned()
            .chain(self.context.changed_vars.iter().map(Target::var))
            .chain(std::iter::once(Target::step(self.name.as_str())))
    }

    pub fn produces(&self, target: &Target) -> bool {
        match target {
            Target::Step(name) if *name == self.name => true,
            Target::Var(name) if self.context.changed_vars.contains(name) => true,
            _ => self.outputs.contains(target) || self.context.default_output.contains(target),
        }
    }

    /// Every target the node needs before it can run.
    pub fn consumed(&self) -> impl Iterator<Item = &Target> + '_ {
        self.inputs.targets().iter().chain(self.depends.targets())
    }

    /// Short label for messages, e.g. `align_1 (3)`.
    pub fn label(&self) -> String {
        format!("{} ({})", self.name, self.id)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_status_strings() {
        assert_eq!("none", Status::default().to_string());
        assert_eq!("workflow_running_pending", Status::WorkflowRunningPending.as_str());
        assert!(Status::SignaturePending.is_pending());
        assert!(!Status::Running.is_pending());
        assert!(Status::Failed.is_done());
    }

    #[test]
    fn test_produced_targets() {
        let mut node = Node {
            id: NodeId::from(0usize),
            step: StepId::from(0usize),
            step_uuid: Uuid::nil(),
            name: "count_1".to_owned(),
            index: Some(1),
            inputs: TargetSet::default(),
            depends: TargetSet::default(),
            outputs: TargetSet::Determined(vec![Target::file("n.txt")]),
            context: Context::default(),
            status: Status::default(),
            pending_tasks: Vec::new(),
            host: None,
            pending_workflow: None,
            from_nested: false,
        };
        node.context.changed_vars.insert("total".to_owned());
        node.context.default_output.push(Target::step("count"));

        let produced: Vec<_> = node.produced().collect();
        assert_eq!(
            vec![
                Target::file("n.txt"),
                Target::step("count"),
                Target::var("total"),
                Target::step("count_1")
            ],
            produced
        );
        assert!(node.produces(&Target::var("total")));
        assert!(!node.produces(&Target::var("other")));
    }
}

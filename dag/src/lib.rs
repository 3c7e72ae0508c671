//! The step dependency graph.
//!
//! A [`Dag`] is built in 3 steps:
//! 1. The planner adds a node for each step of the forward workflow.
//! 2. The resolver adds nodes for auxiliary steps that produce targets nobody else does,
//!    repeating until no target is left dangling.
//! 3. If the user asked for specific targets, the graph is pruned to their ancestors.
//!
//! The executor then mutates node status as steps run, and may call back into the
//! resolver when a running step discovers a target it didn't declare.

mod node;
pub use node::{Context, Node, NodeId, Status};

mod graph;
pub use graph::Dag;

mod resolve;
pub use resolve::Resolver;

mod plan;
pub use plan::plan;

mod snapshot;
pub use snapshot::{DagSnapshot, NodeSnapshot};

use workflow::Target;

/// Problems with the shape of the workflow, found before or while it runs.
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("No step provides {0}")]
    Unsatisfiable(Target),
    #[error("{0} is provided by more than one step: {1}")]
    Ambiguous(Target, String),
    #[error("Circular dependency: {0}")]
    Cycle(String),
    #[error("Malformed step \"{0}\": {1}")]
    Malformed(String, String),
}

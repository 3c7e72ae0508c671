//! Everything the scheduler knows about a workflow before it starts running:
//! targets, step descriptors loaded from a script, and the static analysis
//! that turns a descriptor into concrete target sets.

mod namespace;
pub use namespace::{expand, parse_value, render_value, shell_quote, Bindings, Namespace};

mod target;
pub use target::{
    CustomTarget, ExistKind, RemoveKind, Target, TargetEnv, TargetSet,
};

mod pattern;
pub use pattern::Pattern;

mod step;
pub use step::{DeclaredTargets, StepDescriptor, StepOptions, TargetTemplate};

mod analyze;
pub use analyze::{analyze, StepAnalysis};

mod workflow;
pub use workflow::{StepId, Workflow, DEFAULT_WORKFLOW};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Step \"{0}\" is defined more than once")]
    DuplicateStep(String),
    #[error("Unknown option \"{1}\" in step \"{0}\"")]
    UnknownOption(String, String),
    #[error("Option \"{1}\" in step \"{0}\" {2}")]
    BadOption(String, String, &'static str),
    #[error("Variable \"{0}\" is not defined")]
    UndefinedVariable(String),
    #[error("Global \"{0}\" needs a value")]
    UnboundGlobal(String),
    #[error("Invalid target pattern \"{0}\": {1}")]
    BadPattern(String, String),
    #[error("Workflow \"{0}\" has no steps")]
    EmptyWorkflow(String),
    #[error("Step \"{0}\" not found")]
    StepNotFound(String),
}

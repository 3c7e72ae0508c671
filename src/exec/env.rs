use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use workflow::{Namespace, Target, TargetEnv};

use super::signature::SignatureStore;

/// Run state that targets are checked against: the working directory,
/// completed steps, and the shared namespace.
///
/// The orchestrator owns the authoritative copy; workers build one from
/// the snapshot they were sent.
#[derive(Debug, Clone)]
pub struct RunEnv {
    root: PathBuf,
    signatures: SignatureStore,
    pub completed: BTreeSet<String>,
    pub vars: Namespace,
}

impl RunEnv {
    pub fn new(root: &Path, signatures: SignatureStore) -> Self {
        Self {
            root: root.to_path_buf(),
            signatures,
            completed: BTreeSet::new(),
            vars: Namespace::new(),
        }
    }

    pub fn with_vars(mut self, vars: Namespace) -> Self {
        self.vars = vars;
        self
    }

    /// Treat every step target in `targets` as completed.
    pub fn with_completed<'a>(mut self, targets: impl IntoIterator<Item = &'a Target>) -> Self {
        for target in targets {
            if let Target::Step(name) = target {
                self.completed.insert(name.clone());
            }
        }
        self
    }

    pub fn signatures(&self) -> &SignatureStore {
        &self.signatures
    }
}

impl TargetEnv for RunEnv {
    fn root(&self) -> &Path {
        &self.root
    }

    fn step_completed(&self, name: &str) -> bool {
        self.completed.contains(name)
    }

    fn variable(&self, name: &str) -> Option<&Value> {
        self.vars.get(name)
    }

    fn signature_path(&self, target: &Target) -> PathBuf {
        self.signatures.target_path(target)
    }

    fn reset_step(&mut self, name: &str) {
        self.completed.remove(name);
    }

    fn unset_variable(&mut self, name: &str) {
        self.vars.remove(name);
    }
}

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use workflow::TargetSet;

use crate::Dag;

/// Serializable view of one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub id: usize,
    pub name: String,
    pub uuid: String,
    pub index: Option<u32>,
    pub status: String,
    /// `None` for an undetermined set
    pub inputs: Option<Vec<String>>,
    pub depends: Option<Vec<String>>,
    pub outputs: Option<Vec<String>>,
    pub pending_tasks: Vec<String>,
}

/// Deterministic, serializable view of a [`Dag`]: nodes in id order and
/// edges as sorted `(from, to)` pairs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DagSnapshot {
    pub nodes: Vec<NodeSnapshot>,
    pub edges: Vec<(usize, usize)>,
}

fn strings(set: &TargetSet) -> Option<Vec<String>> {
    match set {
        TargetSet::Undetermined => None,
        TargetSet::Determined(targets) => Some(targets.iter().map(|t| t.to_string()).collect()),
    }
}

impl DagSnapshot {
    pub(crate) fn of(dag: &Dag) -> Self {
        let nodes = dag
            .nodes()
            .map(|node| NodeSnapshot {
                id: node.id.into(),
                name: node.name.clone(),
                uuid: node.step_uuid.to_string(),
                index: node.index,
                status: node.status.to_string(),
                inputs: strings(&node.inputs),
                depends: strings(&node.depends),
                outputs: strings(&node.outputs),
                pending_tasks: node.pending_tasks.clone(),
            })
            .collect();
        let edges = dag
            .nodes()
            .flat_map(|node| {
                dag.succs(node.id)
                    .iter()
                    .map(move |&succ| (usize::from(node.id), usize::from(succ)))
            })
            .collect();
        Self { nodes, edges }
    }

    /// One line of json.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Read the last snapshot in a dag file.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading dag file {}", path.display()))?;
        let line = text
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .with_context(|| format!("dag file {} is empty", path.display()))?;
        serde_json::from_str(line).with_context(|| format!("parsing dag file {}", path.display()))
    }
}

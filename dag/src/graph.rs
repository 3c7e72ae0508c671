use std::cmp::Reverse;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result};
use util::IdVec;
use workflow::{ExistKind, RemoveKind, StepAnalysis, StepDescriptor, StepId, Target, TargetEnv, TargetSet};

use crate::{Context, DagSnapshot, Node, NodeId, Status};

const QUEUE_CAPACITY: usize = 32;

// neighbors of a node added since the last build:
static NO_NODES: BTreeSet<NodeId> = BTreeSet::new();

/// Producers and consumers of one target.
#[derive(Debug, Default, Clone)]
struct Edges {
    producers: Vec<NodeId>,
    consumers: Vec<NodeId>,
}

/// Dependency graph of step nodes.
///
/// Nodes live in a table indexed by [`NodeId`]; edges are derived from a second
/// table mapping each target to the nodes producing and consuming it.
/// Call [`Dag::build`] after changing any node's targets.
#[derive(Debug, Default)]
pub struct Dag {
    nodes: IdVec<NodeId, Node>,
    edges: BTreeMap<Target, Edges>,
    preds: Vec<BTreeSet<NodeId>>,
    succs: Vec<BTreeSet<NodeId>>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Node {
        self.nodes.get(id)
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut Node {
        self.nodes.get_mut(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter()
    }

    pub fn preds(&self, id: NodeId) -> &BTreeSet<NodeId> {
        self.preds.get(usize::from(id)).unwrap_or(&NO_NODES)
    }

    pub fn succs(&self, id: NodeId) -> &BTreeSet<NodeId> {
        self.succs.get(usize::from(id)).unwrap_or(&NO_NODES)
    }

    pub fn set_status(&mut self, id: NodeId, status: Status) {
        let node = self.nodes.get_mut(id);
        log::debug!("{}: {} -> {}", node.label(), node.status, status);
        node.status = status;
    }

    /// Nodes that produce `target`.
    pub fn producers(&self, target: &Target) -> Vec<NodeId> {
        self.nodes
            .iter()
            .filter(|node| node.produces(target))
            .map(|node| node.id)
            .collect()
    }

    /// Find a node for the given step with the given pattern bindings.
    pub fn find(&self, step_uuid: &uuid::Uuid, vars: &workflow::Namespace) -> Option<NodeId> {
        self.nodes
            .iter()
            .find(|node| node.step_uuid == *step_uuid && node.context.vars == *vars)
            .map(|node| node.id)
    }

    /// Add a node for `step` from its analysis. Call [`Dag::build`] afterwards.
    pub fn add_step(
        &mut self,
        step_id: StepId,
        step: &StepDescriptor,
        analysis: StepAnalysis,
        vars: workflow::Namespace,
        default_output: Vec<Target>,
    ) -> NodeId {
        let id = NodeId::from(self.nodes.len());
        let node = Node {
            id,
            step: step_id,
            step_uuid: step.uuid,
            name: step.name.clone(),
            index: step.index,
            inputs: analysis.step_input,
            depends: analysis.step_depends,
            outputs: analysis.step_output,
            context: Context {
                signature_vars: analysis.signature_vars,
                environ_vars: analysis.environ_vars,
                changed_vars: analysis.changed_vars,
                vars,
                default_output,
            },
            status: Status::Waiting,
            pending_tasks: Vec::with_capacity(0),
            host: None,
            pending_workflow: None,
            from_nested: false,
        };
        log::debug!("adding node {}", node.label());
        self.nodes.push(node)
    }

    /// (Re)compute edges from the targets nodes produce and consume.
    pub fn build(&mut self) {
        self.edges.clear();
        for node in self.nodes.iter() {
            for target in node.produced() {
                self.edges.entry(target).or_default().producers.push(node.id);
            }
            for target in node.consumed() {
                let consumers = &mut self.edges.entry(target.clone()).or_default().consumers;
                if !consumers.contains(&node.id) {
                    consumers.push(node.id);
                }
            }
        }
        self.preds = vec![BTreeSet::new(); self.nodes.len()];
        self.succs = vec![BTreeSet::new(); self.nodes.len()];
        for edges in self.edges.values() {
            for &consumer in &edges.consumers {
                for &producer in &edges.producers {
                    if producer != consumer {
                        self.preds[usize::from(consumer)].insert(producer);
                        self.succs[usize::from(producer)].insert(consumer);
                    }
                }
            }
        }
    }

    /// Targets consumed by some node (or in `extra`) that no node produces.
    ///
    /// Returns `(unresolved, existing)`, where `existing` are the ones that can
    /// be consumed as they are.
    pub fn dangling(
        &self,
        extra: &[Target],
        env: &dyn TargetEnv,
    ) -> Result<(Vec<Target>, Vec<Target>)> {
        let consumed: BTreeSet<&Target> = self
            .nodes
            .iter()
            .flat_map(|node| node.consumed())
            .chain(extra)
            .collect();
        let (mut unresolved, mut existing) = (Vec::new(), Vec::new());
        for target in consumed {
            if self.nodes.iter().any(|node| node.produces(target)) {
                continue;
            }
            if target.exists(ExistKind::Target, env)? {
                existing.push(target.clone());
            } else {
                unresolved.push(target.clone());
            }
        }
        Ok((unresolved, existing))
    }

    /// True if the node is waiting and all its predecessors have completed.
    pub fn is_runnable(&self, id: NodeId) -> bool {
        self.node(id).status == Status::Waiting
            && self
                .preds(id)
                .iter()
                .all(|&p| self.node(p).status == Status::Completed)
    }

    /// Pick the next node to run.
    ///
    /// Runnable nodes are ordered by index (unindexed last), then by number of
    /// unfinished dependents (most first), then by id.
    pub fn find_executable(&self) -> Option<NodeId> {
        self.nodes
            .ids()
            .filter(|&id| self.is_runnable(id))
            .min_by_key(|&id| {
                let outstanding = self
                    .succs(id)
                    .iter()
                    .filter(|&&s| self.node(s).status != Status::Completed)
                    .count();
                (self.node(id).index.unwrap_or(u32::MAX), Reverse(outstanding), id)
            })
    }

    /// Replace a finished node's targets with their concrete values, and rebuild.
    pub fn update_step(
        &mut self,
        id: NodeId,
        inputs: Option<TargetSet>,
        outputs: Option<TargetSet>,
        depends: Option<TargetSet>,
    ) {
        let node = self.nodes.get_mut(id);
        if let Some(inputs) = inputs {
            node.inputs = inputs;
        }
        if let Some(outputs) = outputs {
            node.outputs = outputs;
        }
        if let Some(depends) = depends {
            node.depends = depends;
        }
        self.build();
    }

    /// Mark `target` dirty: remove its signature and reset its completed producers.
    /// Returns true if the target has a producer in the graph.
    pub fn regenerate_target(&mut self, target: &Target, env: &mut dyn TargetEnv) -> Result<bool> {
        target.remove(RemoveKind::Signature, env)?;
        let producers = self.producers(target);
        for &id in &producers {
            if self.node(id).status == Status::Completed {
                let name = self.node(id).name.clone();
                env.reset_step(&name);
                self.set_status(id, Status::Waiting);
            }
        }
        Ok(!producers.is_empty())
    }

    /// A new graph with only the nodes needed to produce `targets`.
    pub fn subgraph_from(&self, targets: &[Target]) -> Dag {
        let mut keep = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = VecDeque::with_capacity(QUEUE_CAPACITY);
        for target in targets {
            queue.extend(self.producers(target));
        }
        while let Some(id) = queue.pop_front() {
            if keep.insert(id) {
                queue.extend(self.preds(id).iter().copied());
            }
        }

        let mut sub = Dag::new();
        for id in keep {
            let mut node = self.node(id).clone();
            node.id = NodeId::from(sub.nodes.len());
            sub.nodes.push(node);
        }
        sub.build();
        sub
    }

    /// Nodes forming a cycle, in edge order, or an empty list if there is none.
    pub fn circular_dependencies(&self) -> Vec<NodeId> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            OnStack,
            Done,
        }
        let mut marks = vec![Mark::New; self.nodes.len()];

        for root in self.nodes.ids() {
            if marks[usize::from(root)] != Mark::New {
                continue;
            }
            // iterative dfs; each frame is a node and its remaining successors.
            let mut path: Vec<NodeId> = vec![root];
            let mut stack = vec![self.succs(root).iter().copied().collect::<Vec<_>>()];
            marks[usize::from(root)] = Mark::OnStack;
            while let Some(next) = stack.last_mut() {
                match next.pop() {
                    Some(succ) => match marks[usize::from(succ)] {
                        Mark::OnStack => {
                            let start = path.iter().position(|&n| n == succ).unwrap_or(0);
                            return path[start..].to_vec();
                        }
                        Mark::New => {
                            marks[usize::from(succ)] = Mark::OnStack;
                            path.push(succ);
                            stack.push(self.succs(succ).iter().copied().collect());
                        }
                        Mark::Done => (),
                    },
                    None => {
                        stack.pop();
                        if let Some(done) = path.pop() {
                            marks[usize::from(done)] = Mark::Done;
                        }
                    }
                }
            }
        }
        Vec::with_capacity(0)
    }

    /// Describe a cycle by node names, e.g. `a -> b -> a`.
    pub fn describe_cycle(&self, cycle: &[NodeId]) -> String {
        let mut names: Vec<&str> = cycle.iter().map(|&id| self.node(id).name.as_str()).collect();
        if let Some(&first) = names.first() {
            names.push(first);
        }
        names.join(" -> ")
    }

    /// Current state as a serializable snapshot.
    pub fn snapshot(&self) -> DagSnapshot {
        DagSnapshot::of(self)
    }

    /// Write a snapshot line to `path`.
    /// With `init`, the file is replaced atomically by one holding just this
    /// snapshot; otherwise the line is appended with a single write.
    pub fn save(&self, path: &Path, init: bool) -> Result<()> {
        let mut line = self.snapshot().to_line()?;
        line.push('\n');

        if !init && path.exists() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(path)
                .with_context(|| format!("opening dag file {}", path.display()))?;
            file.write_all(line.as_bytes())
                .with_context(|| format!("appending to {}", path.display()))?;
            return Ok(());
        }

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        let mut file = std::fs::File::create(&tmp)
            .with_context(|| format!("creating {}", tmp.display()))?;
        file.write_all(line.as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }
}

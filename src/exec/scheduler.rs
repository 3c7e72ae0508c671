use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dag::{Dag, NodeId, PlanError, Resolver, Status};
use workflow::{Namespace, StepId, Target, Workflow};

use super::env::RunEnv;
use super::errors::ErrorSink;
use super::message::{Counters, StepJob, StepReply, StepResult};
use crate::fs::Report;
use crate::ui::Ui;

/// How often a node may ask for the same missing target before it fails.
const MAX_NEEDS: u32 = 3;

const LOCK_BACKOFF_START: Duration = Duration::from_millis(100);
const LOCK_BACKOFF_MAX: Duration = Duration::from_secs(5);

/// What applying a step reply did to the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    Completed { skipped: bool },
    /// the node goes back to waiting, after the graph was extended or regenerated
    Retry,
    Locked,
    Failed(String),
}

/// Owns the graph of one workflow run and every decision about it.
///
/// Both the top-level orchestrator and a nested workflow running on a
/// worker drive one of these; they differ only in how jobs reach workers.
pub struct Scheduler {
    wf: Arc<Workflow>,
    name: String,
    workflow_id: String,
    auxiliary: Vec<StepId>,
    pub dag: Dag,
    pub env: RunEnv,
    pub errors: ErrorSink,
    pub counters: Counters,
    /// we are running inside a step, so our steps count as substeps
    substeps: bool,
    dag_file: Option<PathBuf>,
    report: Option<Report>,
    /// lock retry time and current back-off, per node
    backoff: BTreeMap<NodeId, (Instant, Duration)>,
    needs: BTreeMap<(NodeId, Target), u32>,
    /// dry-run stand-ins to remove at the end
    pub placeholders: Vec<PathBuf>,
    initial_vars: Namespace,
    ui: Ui,
}

impl Scheduler {
    pub fn new(
        wf: Arc<Workflow>,
        name: &str,
        workflow_id: String,
        env: RunEnv,
        substeps: bool,
        ui: Ui,
    ) -> Self {
        let auxiliary = wf.auxiliary_steps(name);
        let initial_vars = env.vars.clone();
        Self {
            wf,
            name: name.to_owned(),
            workflow_id,
            auxiliary,
            dag: Dag::new(),
            env,
            errors: ErrorSink::default(),
            counters: Counters::default(),
            substeps,
            dag_file: None,
            report: None,
            backoff: BTreeMap::new(),
            needs: BTreeMap::new(),
            placeholders: Vec::with_capacity(0),
            initial_vars,
            ui,
        }
    }

    /// Write a snapshot of the graph to `path` on every status change.
    pub fn with_dag_file(mut self, path: Option<PathBuf>) -> Self {
        self.dag_file = path;
        self
    }

    /// Record step events in `report`.
    pub fn with_report(mut self, report: Report) -> Self {
        self.report = Some(report);
        self
    }

    /// Build the graph: forward steps, then providers for everything dangling,
    /// pruned to what `targets` need if there are any.
    pub fn plan(&mut self, targets: &[Target]) -> Result<()> {
        let forward = match self.wf.forward_steps(&self.name) {
            Ok(forward) => forward,
            Err(e) if !targets.is_empty() => {
                log::debug!("no forward steps ({e}); planning from targets alone");
                Vec::with_capacity(0)
            }
            Err(e) => return Err(e),
        };
        let mut dag = dag::plan(&self.wf, &forward, &self.env.vars)?;
        Resolver::new(&self.wf, &self.auxiliary, &self.env.vars)
            .resolve(&mut dag, targets, &self.env)
            .with_context(|| format!("while planning workflow \"{}\"", self.name))?;
        if !targets.is_empty() {
            dag = dag.subgraph_from(targets);
        }
        let cycle = dag.circular_dependencies();
        if !cycle.is_empty() {
            return Err(PlanError::Cycle(dag.describe_cycle(&cycle)).into());
        }
        self.dag = dag;
        log::info!("workflow \"{}\" has {} steps", self.name, self.dag.len());
        self.save(true)
    }

    /// The next node to run, marked running, with its job.
    /// Nodes with `skip=true` are completed on the way without running.
    pub fn next_job(&mut self) -> Result<Option<(NodeId, StepJob)>> {
        while let Some(id) = self.dag.find_executable() {
            let node = self.dag.node(id);
            if self.wf.get_step(node.step).options.skip == Some(true) {
                log::info!("{}: skipped by option", node.label());
                self.finish(
                    id,
                    StepResult {
                        skipped: true,
                        ..Default::default()
                    },
                )?;
                continue;
            }
            let job = self.job(id);
            self.dag.set_status(id, Status::Running);
            self.event(id, "running")?;
            self.save(false)?;
            return Ok(Some((id, job)));
        }
        Ok(None)
    }

    fn job(&self, id: NodeId) -> StepJob {
        let node = self.dag.node(id);
        let ctx = &node.context;

        let var_targets = node.consumed().filter_map(|t| match t {
            Target::Var(name) => Some(name),
            _ => None,
        });
        let mut vars = Namespace::new();
        for name in ctx.environ_vars.iter().chain(&ctx.signature_vars).chain(var_targets) {
            if let Some(val) = self.env.vars.get(name) {
                vars.insert(name.clone(), val.clone());
            }
        }
        vars.extend(ctx.vars.clone());

        let mut signature_vars = ctx.signature_vars.clone();
        signature_vars.extend(ctx.vars.keys().cloned());

        StepJob {
            step: node.step,
            label: node.label(),
            stem: stem(&node.name, &ctx.vars),
            inputs: node.inputs.clone(),
            depends: node.depends.clone(),
            outputs: node.outputs.clone(),
            vars,
            signature_vars,
        }
    }

    /// Fold a worker's reply for node `id` into the graph.
    pub fn apply(&mut self, id: NodeId, reply: StepReply) -> Result<Applied> {
        match reply {
            StepReply::Done(result) => {
                let skipped = result.skipped;
                self.finish(id, result)?;
                Ok(Applied::Completed { skipped })
            }
            StepReply::Need(target) | StepReply::Regen(target) => self.need(id, target),
            StepReply::Locked { output, sig } => {
                let label = self.dag.node(id).label();
                log::debug!("{label}: {output} is locked by {}", sig.display());
                self.ui.pending(&label, &format!("locked: {}", sig.display()));
                let delay = match self.backoff.get(&id) {
                    Some((_, prev)) => (*prev * 2).min(LOCK_BACKOFF_MAX),
                    None => LOCK_BACKOFF_START,
                };
                self.backoff.insert(id, (Instant::now() + delay, delay));
                self.dag.set_status(id, Status::SignaturePending);
                self.save(false)?;
                Ok(Applied::Locked)
            }
            StepReply::Failed(msg) => {
                self.fail(id, &msg)?;
                Ok(Applied::Failed(msg))
            }
        }
    }

    fn finish(&mut self, id: NodeId, result: StepResult) -> Result<()> {
        if let Some(outputs) = result.outputs {
            self.dag.update_step(id, None, Some(outputs), None);
        }
        for (name, val) in &result.shared {
            self.env.vars.insert(name.clone(), val.clone());
        }
        let succs: Vec<NodeId> = self.dag.succs(id).iter().copied().collect();
        for succ in succs {
            let ctx = &mut self.dag.node_mut(succ).context;
            for (name, val) in &result.shared {
                if ctx.environ_vars.contains(name) {
                    ctx.vars.insert(name.clone(), val.clone());
                }
            }
        }
        let completed: Vec<String> = self
            .dag
            .node(id)
            .produced()
            .filter_map(|t| match t {
                Target::Step(name) => Some(name),
                _ => None,
            })
            .collect();
        self.env.completed.extend(completed);

        self.counters.count(self.substeps, result.skipped);
        self.counters += result.counters;
        self.placeholders.extend(result.placeholders);
        self.backoff.remove(&id);

        self.dag.set_status(id, Status::Completed);
        self.ui.completed(&self.dag.node(id).label(), result.skipped);
        self.event(id, if result.skipped { "skipped" } else { "completed" })?;
        self.save(false)
    }

    /// The node needs `target`: make sure something will produce it,
    /// and put the node back to wait for it.
    fn need(&mut self, id: NodeId, target: Target) -> Result<Applied> {
        let count = self.needs.entry((id, target.clone())).or_default();
        *count += 1;
        if *count > MAX_NEEDS {
            let msg = format!("{target} is still missing after {MAX_NEEDS} attempts");
            self.fail(id, &msg)?;
            return Ok(Applied::Failed(msg));
        }
        log::info!("{} needs {target}", self.dag.node(id).label());

        let node = self.dag.node_mut(id);
        if !node.consumed().any(|t| *t == target) {
            node.depends.push(target.clone());
        }
        self.dag.build();
        if !self.dag.regenerate_target(&target, &mut self.env)? {
            Resolver::new(&self.wf, &self.auxiliary, &self.env.vars)
                .resolve(&mut self.dag, &[], &self.env)
                .with_context(|| format!("while resolving {target}"))?;
        }
        let cycle = self.dag.circular_dependencies();
        if !cycle.is_empty() {
            return Err(PlanError::Cycle(self.dag.describe_cycle(&cycle)))
                .with_context(|| format!("while resolving {target}"));
        }
        self.dag.set_status(id, Status::Waiting);
        self.save(false)?;
        Ok(Applied::Retry)
    }

    pub fn fail(&mut self, id: NodeId, msg: &str) -> Result<()> {
        let label = self.dag.node(id).label();
        self.ui.failed(&label, msg.lines().next().unwrap_or_default());
        self.errors.add(&label, msg);
        self.dag.set_status(id, Status::Failed);
        self.event(id, "failed")?;
        self.save(false)
    }

    /// Move node `id` to `status` while its worker waits on something.
    pub fn set_status(&mut self, id: NodeId, status: Status) -> Result<()> {
        self.dag.set_status(id, status);
        self.event(id, status.as_str())?;
        self.save(false)
    }

    /// Put nodes whose lock back-off has expired back in line.
    pub fn release_locks(&mut self) -> usize {
        let now = Instant::now();
        let ready: Vec<NodeId> = self
            .backoff
            .iter()
            .filter(|(id, (at, _))| {
                *at <= now && self.dag.node(**id).status == Status::SignaturePending
            })
            .map(|(id, _)| *id)
            .collect();
        for &id in &ready {
            self.dag.set_status(id, Status::Waiting);
        }
        ready.len()
    }

    pub fn has_locked(&self) -> bool {
        self.dag
            .nodes()
            .any(|node| node.status == Status::SignaturePending)
    }

    /// Nothing is running, waiting on something, or ready to run.
    pub fn is_done(&self) -> bool {
        !self
            .dag
            .nodes()
            .any(|node| node.status == Status::Running || node.status.is_pending())
            && self.dag.find_executable().is_none()
    }

    /// Nodes that never ran because something before them failed.
    pub fn unreachable(&self) -> Vec<String> {
        self.dag
            .nodes()
            .filter(|node| node.status == Status::Waiting)
            .map(|node| node.label())
            .collect()
    }

    /// Blame every node left waiting when no failure explains why it never
    /// ran, so a stuck graph does not pass for a finished one.
    pub fn check_stalled(&mut self) {
        if !self.errors.is_empty() {
            return;
        }
        for label in self.unreachable() {
            self.errors.add(&label, "never became runnable");
        }
    }

    /// Variables that differ from what the run started with.
    pub fn changed_vars(&self) -> Namespace {
        self.env
            .vars
            .iter()
            .filter(|(name, val)| self.initial_vars.get(*name) != Some(*val))
            .map(|(name, val)| (name.clone(), val.clone()))
            .collect()
    }

    fn event(&self, id: NodeId, status: &str) -> Result<()> {
        match &self.report {
            Some(report) => report.step(&self.workflow_id, &self.dag.node(id).label(), status),
            None => Ok(()),
        }
    }

    fn save(&self, init: bool) -> Result<()> {
        match &self.dag_file {
            Some(path) => self.dag.save(path, init),
            None => Ok(()),
        }
    }
}

/// File stem for a node's logs and signature: the step name, plus a hash of
/// its bindings if it has any.
fn stem(name: &str, vars: &Namespace) -> String {
    if vars.is_empty() {
        return name.to_owned();
    }
    let mut hasher = blake3::Hasher::new();
    for (key, val) in vars {
        hasher.update(key.as_bytes());
        hasher.update(b"=");
        hasher.update(val.to_string().as_bytes());
        hasher.update(b"\n");
    }
    format!("{name}-{}", &hasher.finalize().to_hex().as_str()[..8])
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use crate::exec::signature::SignatureStore;
    use std::path::Path;

    pub fn scheduler(text: &str, dir: &Path, targets: &[Target]) -> Result<Scheduler> {
        let wf = Workflow::load(syntax::parse(text)?, text)?;
        let env = RunEnv::new(dir, SignatureStore::new(dir.join(".sos/sig")))
            .with_vars(wf.globals().clone());
        let name = wf.default_name().to_owned();
        let mut sched = Scheduler::new(Arc::new(wf), &name, "wf".to_owned(), env, false, Ui::new(0));
        sched.plan(targets)?;
        Ok(sched)
    }

    /// Run every job to completion in order, returning the labels run.
    fn run_all(sched: &mut Scheduler) -> Result<Vec<String>> {
        let mut order = Vec::new();
        while let Some((id, job)) = sched.next_job()? {
            order.push(job.label.split(' ').next().unwrap_or_default().to_owned());
            sched.apply(id, StepReply::Done(StepResult::default()))?;
        }
        Ok(order)
    }

    const LINEAR: &str = r#"
step default_1 > "f1" {
    touch f1
}
step default_2 > "f2" {
    touch f2
}
step default_3 > "f3" {
    touch f3
}
"#;

    #[test]
    fn test_linear_order() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sched = scheduler(LINEAR, dir.path(), &[])?;
        assert_eq!(vec!["default_1", "default_2", "default_3"], run_all(&mut sched)?);
        assert!(sched.is_done());
        assert_eq!(3, sched.counters.step_completed);
        assert!(sched.dag.nodes().all(|n| n.status == Status::Completed));
        Ok(())
    }

    #[test]
    fn test_failure_leaves_successors_unreachable() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sched = scheduler(LINEAR, dir.path(), &[])?;
        let (id, _) = sched.next_job()?.unwrap();
        let applied = sched.apply(id, StepReply::Failed("boom\ntrace".to_owned()))?;
        assert_eq!(Applied::Failed("boom\ntrace".to_owned()), applied);
        assert!(sched.next_job()?.is_none());
        assert!(sched.is_done());
        assert_eq!(vec!["default_2 (1)", "default_3 (2)"], sched.unreachable());
        assert_eq!(1, sched.errors.len());
        Ok(())
    }

    const SHARED: &str = r#"
global {
    n=1
}
step default_1 :: shared=n {
    echo "n=5" >> "$SOS_SHARED"
}
step default_2 {
    echo "$n"
}
step default_3 :: skip=true {
    echo never
}
"#;

    #[test]
    fn test_shared_vars_and_skip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sched = scheduler(SHARED, dir.path(), &[])?;
        let (id, _) = sched.next_job()?.unwrap();
        let result = StepResult {
            shared: Namespace::from([("n".to_owned(), 5.into())]),
            ..Default::default()
        };
        sched.apply(id, StepReply::Done(result))?;
        assert!(sched.env.completed.contains("default_1"));

        let (id, job) = sched.next_job()?.unwrap();
        assert_eq!(Some(&serde_json::Value::from(5)), job.vars.get("n"));
        assert_eq!(
            Namespace::from([("n".to_owned(), 5.into())]),
            sched.changed_vars()
        );
        sched.apply(id, StepReply::Done(StepResult::default()))?;

        // default_3 is completed without being handed out:
        assert!(sched.next_job()?.is_none());
        assert!(sched.is_done());
        assert_eq!(2, sched.counters.step_completed);
        assert_eq!(1, sched.counters.step_skipped);
        Ok(())
    }

    const UNKNOWN: &str = r#"
step default_1 {
    cat ref.fa
}
step download_ref :: provides="ref.fa" {
    touch ref.fa
}
"#;

    #[test]
    fn test_need_that_closes_a_cycle() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sched = scheduler(LINEAR, dir.path(), &[])?;
        let (id, _) = sched.next_job()?.unwrap();
        // f2 is made downstream of default_1, so depending on it is circular:
        let e = sched.apply(id, StepReply::Need(Target::file("f2"))).unwrap_err();
        assert!(matches!(e.downcast_ref::<PlanError>(), Some(PlanError::Cycle(_))));
        Ok(())
    }

    #[test]
    fn test_stalled_graph_is_an_error() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sched = scheduler(LINEAR, dir.path(), &[])?;
        let (id, _) = sched.next_job()?.unwrap();
        // stopped without a recorded reason:
        sched.dag.set_status(id, Status::Failed);
        assert!(sched.is_done());
        sched.check_stalled();
        assert!(sched.errors.summary().contains("default_2 (1): never became runnable"));

        // a real failure already explains the rest:
        let mut sched = scheduler(LINEAR, dir.path(), &[])?;
        let (id, _) = sched.next_job()?.unwrap();
        sched.apply(id, StepReply::Failed("boom".to_owned()))?;
        sched.check_stalled();
        assert_eq!(1, sched.errors.len());
        Ok(())
    }

    #[test]
    fn test_need_extends_graph() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sched = scheduler(UNKNOWN, dir.path(), &[])?;
        assert_eq!(1, sched.dag.len());
        let (id, _) = sched.next_job()?.unwrap();
        let applied = sched.apply(id, StepReply::Need(Target::file("ref.fa")))?;
        assert_eq!(Applied::Retry, applied);
        assert_eq!(2, sched.dag.len());
        assert_eq!(Status::Waiting, sched.dag.node(id).status);
        assert_eq!(vec!["download_ref", "default_1"], run_all(&mut sched)?);
        assert!(sched.errors.is_empty());
        Ok(())
    }

    #[test]
    fn test_repeated_need_fails() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sched = scheduler(UNKNOWN, dir.path(), &[])?;
        let mut failed = None;
        for _ in 0..10 {
            let Some((id, _)) = sched.next_job()? else {
                break;
            };
            if sched.dag.node(id).name == "download_ref" {
                sched.apply(id, StepReply::Done(StepResult::default()))?;
                continue;
            }
            if let Applied::Failed(msg) = sched.apply(id, StepReply::Need(Target::file("ref.fa")))? {
                failed = Some(msg);
                break;
            }
        }
        assert!(failed.is_some_and(|msg| msg.contains("still missing")));
        Ok(())
    }

    #[test]
    fn test_lock_backoff() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut sched = scheduler(LINEAR, dir.path(), &[])?;
        let (id, _) = sched.next_job()?.unwrap();
        let locked = StepReply::Locked {
            output: Target::file("f1"),
            sig: dir.path().join("lock"),
        };
        assert_eq!(Applied::Locked, sched.apply(id, locked)?);
        assert!(sched.has_locked());
        assert!(!sched.is_done());
        assert!(sched.next_job()?.is_none());
        std::thread::sleep(LOCK_BACKOFF_START);
        assert_eq!(1, sched.release_locks());
        assert_eq!(Some(id), sched.next_job()?.map(|(id, _)| id));
        Ok(())
    }

    #[test]
    fn test_stem() {
        assert_eq!("a_1", stem("a_1", &Namespace::new()));
        let vars = Namespace::from([("year".to_owned(), "2020".into())]);
        let s = stem("make_csv", &vars);
        assert!(s.starts_with("make_csv-"));
        assert_eq!(s, stem("make_csv", &vars));
    }
}

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use dag::{NodeId, Status};

use super::message::{Reply, StepJob, StepReply, Work, WorkflowJob, WorkflowResult};
use super::pool::{WorkerId, WorkerPool};
use super::scheduler::Scheduler;
use super::tasks::{Hosts, Poll, TaskWait};
use super::worker::WorkerEnv;
use super::Error;
use crate::fs::Journal;
use crate::settings::RunConfig;
use crate::ui::Ui;

/// How long one pass of the loop waits for a reply.
const IDLE_WAIT: Duration = Duration::from_millis(100);
/// Minimum time between polls of task hosts.
const TASK_POLL: Duration = Duration::from_millis(250);
/// How long each stage of shutdown waits for workers.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

/// Turn SIGINT into a flag the executor loop checks on every pass.
pub fn install_interrupt_handler() {
    let handler = on_sigint as extern "C" fn(libc::c_int);
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        libc::signal(libc::SIGINT, handler as libc::sighandler_t);
    }
}

/// How a run that didn't fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// we exited with this many tasks still running on their hosts
    Suspended { tasks: usize },
}

/// What a busy or pending worker is doing for us.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Assignment {
    Node(NodeId),
    /// a step of the nested workflow running on `requester`
    Proxy { requester: WorkerId, sub_id: u64 },
    /// the nested workflow `id`
    Workflow { id: u64 },
}

/// The executor loop: hands jobs to workers, relays their requests, and
/// folds their replies into the scheduler.
pub struct Orchestrator {
    sched: Scheduler,
    pool: WorkerPool,
    config: RunConfig,
    hosts: Hosts,
    ui: Ui,
    assignments: BTreeMap<WorkerId, Assignment>,
    /// steps requested by nested workflows, with who asked
    substeps: VecDeque<(WorkerId, u64, Box<StepJob>)>,
    task_waits: BTreeMap<WorkerId, TaskWait>,
    /// pending workers whose wait is over, queued until a slot frees up
    resumptions: VecDeque<(WorkerId, Work)>,
    /// nested workflow id -> the worker waiting on it
    workflows: BTreeMap<u64, WorkerId>,
    next_workflow: u64,
    /// tasks a previous run left running
    resumed_tasks: BTreeSet<String>,
    journal: Journal,
    /// `None` when a new task wait hasn't been polled yet
    last_task_poll: Option<Instant>,
    interrupt: Option<Arc<AtomicBool>>,
}

impl Orchestrator {
    pub fn new(sched: Scheduler, env: WorkerEnv, journal: Journal, ui: Ui) -> Self {
        let config = env.config.clone();
        let hosts = env.hosts.clone();
        Self {
            sched,
            pool: WorkerPool::new(env, config.max_procs),
            config,
            hosts,
            ui,
            assignments: BTreeMap::new(),
            substeps: VecDeque::new(),
            task_waits: BTreeMap::new(),
            resumptions: VecDeque::new(),
            workflows: BTreeMap::new(),
            next_workflow: 1,
            resumed_tasks: BTreeSet::new(),
            journal,
            last_task_poll: None,
            interrupt: None,
        }
    }

    /// Also stop when `flag` is set.
    pub fn with_interrupt_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.interrupt = Some(flag);
        self
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.sched
    }

    pub fn into_scheduler(self) -> Scheduler {
        self.sched
    }

    /// Run until the graph is done, we suspend on pending tasks, or we are
    /// interrupted. Workers are stopped either way.
    pub fn run(&mut self) -> Result<Outcome> {
        self.resume()?;
        let result = self.event_loop();
        self.pool.shutdown(SHUTDOWN_GRACE);
        result
    }

    fn resume(&mut self) -> Result<()> {
        if !self.config.resume_mode {
            return Ok(());
        }
        for (host, id) in self.journal.pending_tasks()? {
            log::info!("resuming task {id} on {host}");
            self.resumed_tasks.insert(id);
        }
        Ok(())
    }

    fn event_loop(&mut self) -> Result<Outcome> {
        loop {
            if self.interrupted() {
                return self.interrupt();
            }
            self.dispatch()?;
            if self.assignments.is_empty() && self.substeps.is_empty() && self.sched.is_done() {
                return Ok(Outcome::Completed);
            }
            self.drain()?;
            self.reap_workers()?;
            self.poll_tasks()?;
            if self.should_suspend() {
                return self.suspend();
            }
        }
    }

    fn interrupted(&self) -> bool {
        INTERRUPTED.load(Ordering::SeqCst)
            || self
                .interrupt
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::SeqCst))
    }

    fn dispatch(&mut self) -> Result<()> {
        self.sched.release_locks();
        // workers already halfway through a step go first
        while self.pool.has_slot() {
            let Some((worker, work)) = self.resumptions.pop_front() else {
                break;
            };
            if !self.pool.set_busy(worker) {
                log::warn!("worker {worker} is no longer waiting, dropping {work:?}");
                continue;
            }
            if let Some(node) = self.node_of(worker) {
                self.sched.set_status(node, Status::Running)?;
            }
            if let Err(e) = self.pool.send(worker, work) {
                log::warn!("cannot resume worker {worker}: {e}");
            }
        }
        while self.pool.has_slot() {
            if let Some((requester, sub_id, job)) = self.substeps.pop_front() {
                let worker = self.acquire()?;
                self.ui.run(&job.label);
                self.assignments
                    .insert(worker, Assignment::Proxy { requester, sub_id });
                self.pool.send(worker, Work::Step(job))?;
                continue;
            }
            let Some((node, job)) = self.sched.next_job()? else {
                break;
            };
            let worker = self.acquire()?;
            self.ui.run(&job.label);
            log::debug!("worker {worker} runs {}", job.label);
            self.assignments.insert(worker, Assignment::Node(node));
            self.pool.send(worker, Work::Step(Box::new(job)))?;
        }
        Ok(())
    }

    fn acquire(&mut self) -> Result<WorkerId> {
        self.pool.acquire()?.context("no free worker slot")
    }

    fn drain(&mut self) -> Result<()> {
        if let Some((worker, reply)) = self.pool.recv(IDLE_WAIT) {
            self.handle(worker, reply)?;
            while let Some((worker, reply)) = self.pool.try_recv() {
                self.handle(worker, reply)?;
            }
        }
        Ok(())
    }

    fn handle(&mut self, worker: WorkerId, reply: Reply) -> Result<()> {
        match reply {
            Reply::Tasks { host, ids } => self.on_tasks(worker, host, ids),
            Reply::Substep { sub_id, job } => {
                log::debug!("worker {worker} asks for substep {}", job.label);
                self.substeps.push_back((worker, sub_id, job));
                Ok(())
            }
            Reply::Workflow(job) => self.on_workflow(worker, job),
            Reply::Step(reply) => self.on_step(worker, reply),
            Reply::WorkflowDone(result) => self.on_workflow_done(worker, result),
        }
    }

    fn node_of(&self, worker: WorkerId) -> Option<NodeId> {
        match self.assignments.get(&worker) {
            Some(Assignment::Node(node)) => Some(*node),
            _ => None,
        }
    }

    fn on_tasks(&mut self, worker: WorkerId, host: String, ids: Vec<String>) -> Result<()> {
        for id in &ids {
            if self.resumed_tasks.remove(id) {
                log::info!("task {id} was submitted by an earlier run");
            }
        }
        self.pool.set_pending(worker);
        if let Some(node) = self.node_of(worker) {
            let n = self.sched.dag.node_mut(node);
            n.pending_tasks = ids.clone();
            n.host = Some(host.clone());
            let label = n.label();
            self.sched.set_status(node, Status::TaskPending)?;
            self.ui
                .pending(&label, &format!("{} tasks on {host}", ids.len()));
        }
        self.task_waits.insert(worker, TaskWait::new(host, ids));
        self.last_task_poll = None;
        Ok(())
    }

    fn on_workflow(&mut self, worker: WorkerId, job: Box<WorkflowJob>) -> Result<()> {
        let id = self.next_workflow;
        self.next_workflow += 1;
        self.pool.set_pending(worker);
        if let Some(node) = self.node_of(worker) {
            self.sched.dag.node_mut(node).pending_workflow = Some(id);
            self.sched.set_status(node, Status::WorkflowPending)?;
        }
        let runner = self.pool.acquire_pending()?;
        log::info!(
            "worker {runner} runs nested workflow {} ({id}) for worker {worker}",
            job.name
        );
        self.assignments.insert(runner, Assignment::Workflow { id });
        self.workflows.insert(id, worker);
        self.pool.send(runner, Work::Workflow { id, job })
    }

    fn on_step(&mut self, worker: WorkerId, reply: StepReply) -> Result<()> {
        self.task_waits.remove(&worker);
        self.pool.release(worker);
        match self.assignments.remove(&worker) {
            Some(Assignment::Node(node)) => {
                self.sched.dag.node_mut(node).pending_tasks.clear();
                self.sched.apply(node, reply)?;
            }
            Some(Assignment::Proxy { requester, sub_id }) => {
                if let Err(e) = self.pool.send(requester, Work::Substep { sub_id, reply }) {
                    log::warn!("dropping substep {sub_id}: {e}");
                }
            }
            other => log::warn!("unexpected step reply from worker {worker} ({other:?})"),
        }
        Ok(())
    }

    fn on_workflow_done(&mut self, worker: WorkerId, result: WorkflowResult) -> Result<()> {
        self.pool.release(worker);
        match self.assignments.remove(&worker) {
            Some(Assignment::Workflow { id }) if id == result.workflow_id => (),
            other => log::warn!("worker {worker} finished workflow {} while {other:?}", result.workflow_id),
        }
        let Some(requester) = self.workflows.remove(&result.workflow_id) else {
            log::warn!("nobody is waiting on workflow {}", result.workflow_id);
            return Ok(());
        };
        if let Some(node) = self.node_of(requester) {
            self.sched.dag.node_mut(node).pending_workflow = None;
        }
        self.resumptions
            .push_back((requester, Work::WorkflowDone(result)));
        Ok(())
    }

    /// Fail whatever was assigned to workers whose thread died.
    fn reap_workers(&mut self) -> Result<()> {
        let dead = self.pool.reap();
        if dead.is_empty() {
            return Ok(());
        }
        // a reply sent just before the thread went away still counts
        while let Some((worker, reply)) = self.pool.try_recv() {
            self.handle(worker, reply)?;
        }
        for worker in dead {
            self.task_waits.remove(&worker);
            self.resumptions.retain(|(w, _)| *w != worker);
            let msg = format!("worker {worker} exited unexpectedly");
            match self.assignments.get(&worker).copied() {
                None => log::warn!("{msg} while idle"),
                Some(Assignment::Workflow { id }) => {
                    log::error!("{msg} running nested workflow {id}");
                    let result = WorkflowResult {
                        workflow_id: id,
                        error: Some(msg),
                        ..Default::default()
                    };
                    self.on_workflow_done(worker, result)?;
                }
                Some(_) => {
                    log::error!("{msg}");
                    self.on_step(worker, StepReply::Failed(msg))?;
                }
            }
        }
        Ok(())
    }

    /// Check on offloaded tasks, and hand results to the workers whose tasks
    /// have all finished.
    fn poll_tasks(&mut self) -> Result<()> {
        if self.task_waits.is_empty() {
            return Ok(());
        }
        if self.last_task_poll.is_some_and(|at| at.elapsed() < TASK_POLL) {
            return Ok(());
        }
        self.last_task_poll = Some(Instant::now());

        let workers: Vec<WorkerId> = self.task_waits.keys().copied().collect();
        for worker in workers {
            let Some(wait) = self.task_waits.get_mut(&worker) else {
                continue;
            };
            let results = match self.hosts.get(&wait.host) {
                Err(e) => Err(e.to_string()),
                Ok(host) => match wait.poll(host.as_ref()) {
                    Poll::Waiting => continue,
                    Poll::Failed(msg) => Err(msg),
                    Poll::Completed => match host.retrieve_results(&wait.ids, self.config.download_timeout) {
                        Ok(results) => {
                            self.sched.counters.task_completed += results.len() as u64;
                            Ok(results)
                        }
                        Err(e) => Err(format!("retrieving results from {}: {e:#}", wait.host)),
                    },
                },
            };
            self.task_waits.remove(&worker);
            self.resumptions.push_back((worker, Work::Tasks(results)));
        }
        Ok(())
    }

    fn wait_for_tasks(&self) -> bool {
        match self.config.wait_for_task {
            Some(wait) => wait,
            None => self.task_waits.values().all(|w| {
                self.hosts
                    .get(&w.host)
                    .map_or(true, |host| host.wait_for_task())
            }),
        }
    }

    /// Everything left is waiting on tasks we were told not to wait for.
    fn should_suspend(&self) -> bool {
        !self.task_waits.is_empty()
            && self.last_task_poll.is_some()
            && self.pool.busy_count() == 0
            && self.resumptions.is_empty()
            && self.substeps.is_empty()
            && self.sched.dag.find_executable().is_none()
            && !self.wait_for_tasks()
    }

    fn pending_tasks(&self) -> Vec<(String, String)> {
        self.task_waits
            .values()
            .flat_map(|w| w.ids.iter().map(|id| (w.host.clone(), id.clone())))
            .collect()
    }

    fn suspend(&mut self) -> Result<Outcome> {
        let tasks = self.pending_tasks();
        self.journal.write(&tasks)?;
        self.ui.summary(&format!(
            "{} tasks are still running; run again with --resume to collect them",
            tasks.len()
        ));
        Ok(Outcome::Suspended { tasks: tasks.len() })
    }

    fn interrupt(&mut self) -> Result<Outcome> {
        log::warn!("interrupted, stopping workers");
        let tasks = self.pending_tasks();
        if !tasks.is_empty() {
            self.journal.write(&tasks)?;
        }
        if self.sched.errors.is_empty() {
            return Err(Error::Interrupted.into());
        }
        self.sched.errors.print("running workflow");
        Err(Error::InterruptedAfterFailure(self.sched.errors.len()).into())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use crate::exec::env::RunEnv;
    use crate::exec::evaluator::{StepContext, StepError, StepEvaluator, StepOutput};
    use crate::exec::message::Counters;
    use crate::exec::run_cmd::ProcessGroups;
    use crate::exec::signature::SignatureStore;
    use crate::exec::tasks::test::ScriptedHost;
    use crate::exec::tasks::{TaskSpec, TaskStatus};
    use crate::exec::worker::WorkerCtx;
    use crate::fs::Fs;
    use crate::settings::SigMode;
    use workflow::{Namespace, Workflow};

    /// Submits two tasks to host "h" for steps with `task` set; runs nested
    /// workflows for steps that name them; otherwise does nothing.
    struct Fake(AtomicUsize);

    impl StepEvaluator for Fake {
        fn evaluate(&self, cx: &StepContext, ctx: &mut WorkerCtx) -> Result<StepOutput, StepError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            let mut output = StepOutput::default();
            for name in &cx.step.options.workflows {
                let result = ctx.run_workflow(name, Vec::new(), Namespace::new())?;
                if let Some(e) = result.error {
                    return Err(StepError::Failed(e));
                }
                output.counters += result.counters;
                output.shared.extend(result.shared);
            }
            if let Some(host) = &cx.step.options.task {
                let specs: Vec<TaskSpec> = (0..2)
                    .map(|i| TaskSpec::new(cx.step, &format!("{}-{i}", cx.job.stem), String::new(), cx.fs.workdir().to_path_buf()))
                    .collect();
                ctx.submit_tasks(host, &specs)?;
            }
            Ok(output)
        }
    }

    fn orchestrator(
        text: &str,
        dir: &std::path::Path,
        host: Option<ScriptedHost>,
        config: RunConfig,
    ) -> Result<(Orchestrator, Arc<Fake>)> {
        let fake = Arc::new(Fake(AtomicUsize::new(0)));
        let orch = orchestrator_with(text, dir, host, config, fake.clone())?;
        Ok((orch, fake))
    }

    fn orchestrator_with(
        text: &str,
        dir: &std::path::Path,
        host: Option<ScriptedHost>,
        config: RunConfig,
        evaluator: Arc<dyn StepEvaluator>,
    ) -> Result<Orchestrator> {
        let wf = Arc::new(Workflow::load(syntax::parse(text)?, text)?);
        let fs = Fs::new(dir);
        let signatures = SignatureStore::new(fs.sig_dir());
        let env = RunEnv::new(dir, signatures.clone()).with_vars(wf.globals().clone());
        let name = wf.default_name().to_owned();
        let mut sched = Scheduler::new(wf.clone(), &name, "wf".to_owned(), env, false, Ui::new(0));
        sched.plan(&[])?;

        let mut hosts = Hosts::default();
        if let Some(host) = host {
            hosts.add(Arc::new(host));
        }
        let env = WorkerEnv {
            wf,
            config,
            fs,
            signatures,
            evaluator,
            hosts,
            groups: ProcessGroups::default(),
        };
        let journal = Journal::new(dir.join("wf.status"));
        Ok(Orchestrator::new(sched, env, journal, Ui::new(0)))
    }

    fn config(max_procs: usize, wait_for_task: Option<bool>) -> RunConfig {
        RunConfig {
            max_procs,
            wait_for_task,
            sig_mode: SigMode::Ignore,
            ..Default::default()
        }
    }

    const TASKS: &str = r#"
step default_1 {
}

step default_2 :: task=h {
}
"#;

    use TaskStatus::*;

    #[test]
    fn test_collects_completed_tasks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = ScriptedHost::new("h", vec![Ok(vec![Pending, Running]), Ok(vec![Completed, Completed])]);
        let (mut orch, fake) = orchestrator(TASKS, dir.path(), Some(host), config(1, Some(true)))?;
        assert_eq!(Outcome::Completed, orch.run()?);
        let sched = orch.into_scheduler();
        assert_eq!(2, fake.0.load(Ordering::SeqCst));
        assert_eq!(2, sched.counters.step_completed);
        assert_eq!(2, sched.counters.task_completed);
        Ok(())
    }

    #[test]
    fn test_suspends_on_pending_tasks() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut host = ScriptedHost::new("h", vec![Ok(vec![Pending, Running])]);
        host.wait = false;
        let (mut orch, _) = orchestrator(TASKS, dir.path(), Some(host), config(2, None))?;
        assert_eq!(Outcome::Suspended { tasks: 2 }, orch.run()?);
        let journal = Journal::new(dir.path().join("wf.status"));
        assert_eq!(2, journal.pending_tasks()?.len());
        assert_eq!(1, orch.scheduler().counters.step_completed);
        Ok(())
    }

    #[test]
    fn test_failed_task_fails_step() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let host = ScriptedHost::new("h", vec![Ok(vec![Completed, Aborted])]);
        let (mut orch, _) = orchestrator(TASKS, dir.path(), Some(host), config(1, Some(true)))?;
        assert_eq!(Outcome::Completed, orch.run()?);
        let sched = orch.into_scheduler();
        assert_eq!(1, sched.errors.len());
        assert!(sched.errors.summary().contains("aborted"));
        Ok(())
    }

    const NESTED: &str = r#"
step default_1 :: workflow=sub {
}

step default_2 {
}

step sub_1 {
}

step sub_2 {
}
"#;

    #[test]
    fn test_nested_workflow_with_one_slot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut orch, fake) = orchestrator(NESTED, dir.path(), None, config(1, None))?;
        assert_eq!(Outcome::Completed, orch.run()?);
        let sched = orch.into_scheduler();
        assert_eq!(4, fake.0.load(Ordering::SeqCst));
        let expected = Counters {
            step_completed: 2,
            substep_completed: 2,
            ..Default::default()
        };
        assert_eq!(expected, sched.counters);
        Ok(())
    }

    #[test]
    fn test_interrupt() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (orch, fake) = orchestrator(NESTED, dir.path(), None, config(1, None))?;
        let flag = Arc::new(AtomicBool::new(true));
        let mut orch = orch.with_interrupt_flag(flag);
        let e = orch.run().unwrap_err();
        assert!(matches!(e.downcast_ref::<Error>(), Some(Error::Interrupted)));
        assert_eq!(0, fake.0.load(Ordering::SeqCst));
        Ok(())
    }

    /// Submits tasks for steps with `task` set, then works for a while,
    /// tracking how many steps are working at once.
    #[derive(Default)]
    struct Gauge {
        active: AtomicUsize,
        peak: AtomicUsize,
    }

    impl StepEvaluator for Gauge {
        fn evaluate(&self, cx: &StepContext, ctx: &mut WorkerCtx) -> Result<StepOutput, StepError> {
            if let Some(host) = &cx.step.options.task {
                let spec = TaskSpec::new(cx.step, &cx.job.stem, String::new(), cx.fs.workdir().to_path_buf());
                ctx.submit_tasks(host, &[spec])?;
            }
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(500));
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(StepOutput::default())
        }
    }

    const SIDE_BY_SIDE: &str = r#"
step main_1 < "a.txt" "b.txt" {
}

step a_1 :: provides=a.txt task=h {
}

step b_2 :: provides=b.txt {
}
"#;

    #[test]
    fn test_finished_tasks_wait_for_a_slot() -> Result<()> {
        let dir = tempfile::tempdir()?;
        // polls pop from the back: a_1's task is still running on the first
        // poll, and done by the time b_2 has taken the only slot
        let host = ScriptedHost::new("h", vec![Ok(vec![Completed]), Ok(vec![Running])]);
        let gauge = Arc::new(Gauge::default());
        let mut orch = orchestrator_with(SIDE_BY_SIDE, dir.path(), Some(host), config(1, Some(true)), gauge.clone())?;
        assert_eq!(Outcome::Completed, orch.run()?);
        let sched = orch.into_scheduler();
        assert!(sched.errors.is_empty(), "{}", sched.errors.summary());
        assert_eq!(3, sched.counters.step_completed);
        assert_eq!(1, sched.counters.task_completed);
        assert_eq!(1, gauge.peak.load(Ordering::SeqCst));
        Ok(())
    }

    /// Panics for steps named `boom`; otherwise does nothing.
    struct Boom;

    impl StepEvaluator for Boom {
        fn evaluate(&self, cx: &StepContext, _ctx: &mut WorkerCtx) -> Result<StepOutput, StepError> {
            if cx.step.name == "boom" {
                panic!("no such luck");
            }
            Ok(StepOutput::default())
        }
    }

    const BOOM: &str = r#"
step main_1 ^ @boom {
}

step boom {
}
"#;

    #[test]
    fn test_panicking_step_fails_the_run() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut orch = orchestrator_with(BOOM, dir.path(), None, config(1, None), Arc::new(Boom))?;
        assert_eq!(Outcome::Completed, orch.run()?);
        let sched = orch.into_scheduler();
        assert_eq!(1, sched.errors.len());
        assert!(sched.errors.summary().contains("no such luck"));
        assert_eq!(0, sched.counters.step_completed);
        Ok(())
    }
}

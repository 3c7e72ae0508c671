use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{Receiver, SyncSender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::Result;
use dag::NodeId;
use workflow::{Namespace, RemoveKind, Target, Workflow};

use super::env::RunEnv;
use super::evaluator::{StepContext, StepError, StepEvaluator};
use super::message::{Reply, StepJob, StepReply, StepResult, Work, WorkflowJob, WorkflowResult};
use super::pool::WorkerId;
use super::run_cmd::ProcessGroups;
use super::scheduler::Scheduler;
use super::signature::{LockAttempt, SignatureStore, StepSignature};
use super::tasks::{Hosts, TaskResult, TaskSpec};
use crate::fs::Fs;
use crate::settings::{RunConfig, SigMode};
use crate::ui::Ui;

/// How long a nested workflow sleeps when all it has left is locked steps.
const LOCK_POLL: Duration = Duration::from_millis(100);

/// What every worker shares.
#[derive(Clone)]
pub struct WorkerEnv {
    pub wf: Arc<Workflow>,
    pub config: RunConfig,
    pub fs: Fs,
    pub signatures: SignatureStore,
    pub evaluator: Arc<dyn StepEvaluator>,
    pub hosts: Hosts,
    pub groups: ProcessGroups,
}

/// A worker's end of its link to the orchestrator.
///
/// Evaluators use it to block on things only the orchestrator can provide.
pub struct WorkerCtx {
    id: WorkerId,
    work: Receiver<Work>,
    replies: SyncSender<(WorkerId, Reply)>,
    hosts: Hosts,
    /// we were told to stop, or lost the orchestrator
    stopped: bool,
}

impl WorkerCtx {
    pub fn new(
        id: WorkerId,
        work: Receiver<Work>,
        replies: SyncSender<(WorkerId, Reply)>,
        hosts: Hosts,
    ) -> Self {
        Self {
            id,
            work,
            replies,
            hosts,
            stopped: false,
        }
    }

    pub fn id(&self) -> WorkerId {
        self.id
    }

    fn send(&mut self, reply: Reply) -> Result<(), StepError> {
        self.replies.send((self.id, reply)).map_err(|_| {
            self.stopped = true;
            StepError::Interrupted
        })
    }

    fn recv(&mut self) -> Result<Work, StepError> {
        match self.work.recv() {
            Ok(Work::Stop) | Err(_) => {
                self.stopped = true;
                Err(StepError::Interrupted)
            }
            Ok(work) => Ok(work),
        }
    }

    fn unexpected(&self, work: &Work, waiting_for: &str) -> StepError {
        StepError::Failed(format!(
            "worker {} got {work:?} while waiting for {waiting_for}",
            self.id
        ))
    }

    /// Hand `tasks` to `host`, and block until the orchestrator has seen
    /// them finish and sends back their results.
    pub fn submit_tasks(
        &mut self,
        host: &str,
        tasks: &[TaskSpec],
    ) -> Result<Vec<TaskResult>, StepError> {
        let handle = self
            .hosts
            .get(host)
            .map_err(|e| StepError::Failed(e.to_string()))?
            .clone();
        for task in tasks {
            handle.submit_task(task)?;
        }
        self.send(Reply::Tasks {
            host: host.to_owned(),
            ids: tasks.iter().map(|t| t.id.clone()).collect(),
        })?;
        match self.recv()? {
            Work::Tasks(Ok(results)) => Ok(results),
            Work::Tasks(Err(msg)) => Err(StepError::Failed(msg)),
            other => Err(self.unexpected(&other, "task results")),
        }
    }

    /// Run workflow `name` to completion somewhere else, and wait for it.
    pub fn run_workflow(
        &mut self,
        name: &str,
        targets: Vec<Target>,
        shared: Namespace,
    ) -> Result<WorkflowResult, StepError> {
        self.send(Reply::Workflow(Box::new(WorkflowJob {
            name: name.to_owned(),
            targets,
            shared,
        })))?;
        match self.recv()? {
            Work::WorkflowDone(result) => Ok(result),
            other => Err(self.unexpected(&other, "a nested workflow")),
        }
    }

    fn request_substep(&mut self, sub_id: u64, job: StepJob) -> Result<(), StepError> {
        self.send(Reply::Substep {
            sub_id,
            job: Box::new(job),
        })
    }

    fn recv_substep(&mut self) -> Result<(u64, StepReply), StepError> {
        match self.recv()? {
            Work::Substep { sub_id, reply } => Ok((sub_id, reply)),
            other => Err(self.unexpected(&other, "a substep")),
        }
    }
}

/// Body of a worker thread: receive work, run it, reply, repeat.
pub fn worker_loop(env: WorkerEnv, mut ctx: WorkerCtx) {
    log::debug!("worker {} started", ctx.id);
    while let Ok(work) = ctx.work.recv() {
        let reply = match work {
            Work::Step(job) => {
                let run = panic::catch_unwind(AssertUnwindSafe(|| execute_step(&env, &job, &mut ctx)));
                Reply::Step(run.unwrap_or_else(|e| {
                    StepReply::Failed(format!("{} panicked: {}", job.label, panic_message(e.as_ref())))
                }))
            }
            Work::Workflow { id, job } => {
                let run = panic::catch_unwind(AssertUnwindSafe(|| run_nested(&env, id, &job, &mut ctx)));
                Reply::WorkflowDone(run.unwrap_or_else(|e| WorkflowResult {
                    workflow_id: id,
                    error: Some(format!(
                        "nested workflow {} panicked: {}",
                        job.name,
                        panic_message(e.as_ref())
                    )),
                    ..Default::default()
                }))
            }
            Work::Stop => break,
            other => {
                log::warn!("worker {} ignoring unexpected {other:?}", ctx.id);
                continue;
            }
        };
        if ctx.stopped || ctx.send(reply).is_err() {
            break;
        }
    }
    log::debug!("worker {} stopped", ctx.id);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown cause"
    }
}

/// Run one step, with signature handling around the evaluator.
pub fn execute_step(env: &WorkerEnv, job: &StepJob, ctx: &mut WorkerCtx) -> StepReply {
    match try_execute(env, job, ctx) {
        Ok(reply) => reply,
        Err(e) => StepReply::Failed(format!("{e:#}")),
    }
}

fn try_execute(env: &WorkerEnv, job: &StepJob, ctx: &mut WorkerCtx) -> Result<StepReply> {
    let step = env.wf.get_step(job.step);
    let config = &env.config;
    let mut run_env = RunEnv::new(env.fs.workdir(), env.signatures.clone())
        .with_vars(job.vars.clone())
        .with_completed(job.inputs.targets().iter().chain(job.depends.targets()));
    let inputs: Vec<Target> = job
        .inputs
        .targets()
        .iter()
        .chain(job.depends.targets())
        .cloned()
        .collect();
    let sig_vars: Namespace = job
        .vars
        .iter()
        .filter(|(name, _)| job.signature_vars.contains(*name))
        .map(|(name, val)| (name.clone(), val.clone()))
        .collect();
    let use_sigs = config.sig_mode != SigMode::Ignore && !config.dryrun();

    let _lock = if use_sigs {
        match env.signatures.lock(&job.stem)? {
            LockAttempt::Acquired(lock) => Some(lock),
            LockAttempt::Busy(sig) => {
                let output = match job.outputs.targets().first() {
                    Some(output) => output.clone(),
                    None => Target::step(step.name.as_str()),
                };
                return Ok(StepReply::Locked { output, sig });
            }
        }
    } else {
        None
    };

    if use_sigs {
        match config.sig_mode {
            SigMode::Default | SigMode::Assert | SigMode::Build => {
                let reason = match env.signatures.load(&job.stem)? {
                    Some(saved) => match saved.check(&step.digest, &sig_vars, &inputs, &run_env)? {
                        None => {
                            log::info!("{}: signature matches, skipping", job.label);
                            let outputs = job
                                .outputs
                                .is_undetermined()
                                .then(|| saved.output_targets().into_iter().collect());
                            return Ok(StepReply::Done(StepResult {
                                outputs,
                                shared: saved.shared,
                                skipped: true,
                                ..Default::default()
                            }));
                        }
                        Some(reason) => reason,
                    },
                    None => "no signature".to_owned(),
                };
                if config.sig_mode == SigMode::Assert {
                    return Ok(StepReply::Failed(format!(
                        "signature mismatch for {}: {reason}",
                        job.label
                    )));
                }
                log::debug!("{}: {reason}", job.label);
                if config.sig_mode == SigMode::Build && outputs_exist(job, &run_env)? {
                    log::info!("{}: recording signature for existing outputs", job.label);
                    save_signatures(env, job, &step.digest, sig_vars, &inputs, job.outputs.targets(), Namespace::new(), &run_env)?;
                    return Ok(StepReply::Done(StepResult {
                        skipped: true,
                        ..Default::default()
                    }));
                }
            }
            SigMode::Force => {
                for target in job.outputs.targets() {
                    target.remove(RemoveKind::Both, &mut run_env)?;
                }
                env.signatures.remove(&job.stem)?;
            }
            SigMode::Ignore => (),
        }
    }

    if config.dryrun() {
        return dryrun(env, job);
    }

    let cx = StepContext {
        step,
        job,
        env: &run_env,
        fs: &env.fs,
        config,
        groups: &env.groups,
    };
    let output = match env.evaluator.evaluate(&cx, ctx) {
        Ok(output) => output,
        Err(StepError::UnknownTarget(target)) => return Ok(StepReply::Need(target)),
        Err(StepError::RemovedTarget(target)) => return Ok(StepReply::Regen(target)),
        Err(StepError::Failed(msg)) => return Ok(StepReply::Failed(msg)),
        Err(StepError::Interrupted) => return Ok(StepReply::Failed("interrupted".to_owned())),
    };

    if use_sigs {
        let outputs = match &output.outputs {
            Some(outputs) => outputs.as_slice(),
            None => job.outputs.targets(),
        };
        run_env.vars.extend(output.shared.clone());
        save_signatures(env, job, &step.digest, sig_vars, &inputs, outputs, output.shared.clone(), &run_env)?;
    }

    Ok(StepReply::Done(StepResult {
        outputs: output.outputs.map(|outputs| outputs.into_iter().collect()),
        shared: output.shared,
        counters: output.counters,
        skipped: false,
        placeholders: Vec::with_capacity(0),
    }))
}

fn outputs_exist(job: &StepJob, env: &RunEnv) -> Result<bool> {
    if job.outputs.is_undetermined() {
        return Ok(false);
    }
    for target in job.outputs.targets() {
        if !target.exists(workflow::ExistKind::Target, env)? {
            return Ok(false);
        }
    }
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
fn save_signatures(
    env: &WorkerEnv,
    job: &StepJob,
    digest: &str,
    vars: Namespace,
    inputs: &[Target],
    outputs: &[Target],
    shared: Namespace,
    run_env: &RunEnv,
) -> Result<()> {
    // only files are stable enough to fingerprint across runs.
    let files: Vec<Target> = outputs.iter().filter(|t| t.is_file()).cloned().collect();
    let sig = StepSignature::compute(digest, vars, inputs, &files, shared, run_env)?;
    env.signatures.save(&job.stem, &sig)?;
    for target in &files {
        env.signatures.save_target(target, run_env)?;
    }
    Ok(())
}

/// Stand in for running the step: create missing output files empty, to be
/// removed when the run ends.
fn dryrun(env: &WorkerEnv, job: &StepJob) -> Result<StepReply> {
    let mut placeholders = Vec::new();
    for target in job.outputs.targets() {
        if let Target::File(path) = target {
            let path = env.fs.workdir().join(path);
            if !env.fs.exists(&path) {
                env.fs.create_parent_dir(&path)?;
                env.fs.create_file(&path)?;
                placeholders.push(path);
            }
        }
    }
    log::info!("{}: dry run, {} placeholders", job.label, placeholders.len());
    Ok(StepReply::Done(StepResult {
        placeholders,
        ..Default::default()
    }))
}

/// Run a nested workflow from this worker, sending its steps back to the
/// orchestrator to run on other workers.
fn run_nested(env: &WorkerEnv, id: u64, job: &WorkflowJob, ctx: &mut WorkerCtx) -> WorkflowResult {
    let mut vars = env.wf.globals().clone();
    vars.extend(job.shared.clone());
    let run_env = RunEnv::new(env.fs.workdir(), env.signatures.clone()).with_vars(vars);
    let mut sched = Scheduler::new(
        env.wf.clone(),
        &job.name,
        format!("{}/{id}", job.name),
        run_env,
        true,
        Ui::new(env.config.verbosity),
    );
    log::info!("worker {} running nested workflow {} ({id})", ctx.id, job.name);

    let mut result = WorkflowResult {
        workflow_id: id,
        ..Default::default()
    };
    if let Err(e) = drive_nested(&mut sched, &job.targets, ctx) {
        result.error = Some(format!("{e:#}"));
    }
    sched.check_stalled();
    result.counters = sched.counters;
    result.shared = sched.changed_vars();
    if result.error.is_none() && !sched.errors.is_empty() {
        result.error = Some(sched.errors.summary());
    }
    result
}

fn drive_nested(sched: &mut Scheduler, targets: &[Target], ctx: &mut WorkerCtx) -> Result<()> {
    let mut outstanding: BTreeMap<u64, NodeId> = BTreeMap::new();
    let result = drive_substeps(sched, targets, ctx, &mut outstanding);
    if result.is_err() {
        // replies to substeps still out there must not reach our next job
        while !outstanding.is_empty() && !ctx.stopped {
            match ctx.recv_substep() {
                Ok((sub_id, _)) => {
                    outstanding.remove(&sub_id);
                }
                Err(e) => {
                    log::warn!("abandoning {} substeps: {e}", outstanding.len());
                    break;
                }
            }
        }
    }
    result
}

fn drive_substeps(
    sched: &mut Scheduler,
    targets: &[Target],
    ctx: &mut WorkerCtx,
    outstanding: &mut BTreeMap<u64, NodeId>,
) -> Result<()> {
    sched.plan(targets)?;
    let mut next_sub = 0u64;
    loop {
        sched.release_locks();
        while let Some((node, job)) = sched.next_job()? {
            ctx.request_substep(next_sub, job)?;
            outstanding.insert(next_sub, node);
            next_sub += 1;
        }
        if outstanding.is_empty() {
            if sched.has_locked() {
                thread::sleep(LOCK_POLL);
                continue;
            }
            break;
        }
        let (sub_id, reply) = ctx.recv_substep()?;
        match outstanding.remove(&sub_id) {
            Some(node) => {
                sched.apply(node, reply)?;
            }
            None => log::warn!("nested workflow got a reply for unknown substep {sub_id}"),
        }
    }
    for label in sched.unreachable() {
        log::warn!("nested step {label} did not run");
    }
    Ok(())
}

use std::collections::{BTreeMap, BTreeSet};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender, TryRecvError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::message::{Reply, Work};
use super::worker::{worker_loop, WorkerCtx, WorkerEnv};

util::id!(
    /// Index of a worker thread, stable for the life of the pool.
    WorkerId,
    u32
);

const REPLY_QUEUE: usize = 256;
const SHUTDOWN_POLL: Duration = Duration::from_millis(20);

struct Handle {
    work: Sender<Work>,
    thread: JoinHandle<()>,
}

/// Worker threads and what each one is doing.
///
/// Only busy workers count against `max_procs`. A pending worker is blocked
/// on tasks or a nested workflow and needs no slot of its own.
pub struct WorkerPool {
    env: WorkerEnv,
    max_procs: usize,
    workers: BTreeMap<WorkerId, Handle>,
    busy: BTreeSet<WorkerId>,
    pending: BTreeSet<WorkerId>,
    idle: BTreeSet<WorkerId>,
    next_id: usize,
    replies_tx: SyncSender<(WorkerId, Reply)>,
    replies: Receiver<(WorkerId, Reply)>,
}

impl WorkerPool {
    pub fn new(env: WorkerEnv, max_procs: usize) -> Self {
        let (replies_tx, replies) = mpsc::sync_channel(REPLY_QUEUE);
        Self {
            env,
            max_procs: max_procs.max(1),
            workers: BTreeMap::new(),
            busy: BTreeSet::new(),
            pending: BTreeSet::new(),
            idle: BTreeSet::new(),
            next_id: 0,
            replies_tx,
            replies,
        }
    }

    pub fn has_slot(&self) -> bool {
        self.busy.len() < self.max_procs
    }

    pub fn busy_count(&self) -> usize {
        self.busy.len()
    }

    pub fn len(&self) -> usize {
        self.workers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// A busy worker, if a slot is free.
    pub fn acquire(&mut self) -> Result<Option<WorkerId>> {
        if !self.has_slot() {
            return Ok(None);
        }
        let id = self.take_idle()?;
        self.busy.insert(id);
        Ok(Some(id))
    }

    /// A worker that starts out pending, slot or no slot.
    pub fn acquire_pending(&mut self) -> Result<WorkerId> {
        let id = self.take_idle()?;
        self.pending.insert(id);
        Ok(id)
    }

    fn take_idle(&mut self) -> Result<WorkerId> {
        if let Some(id) = self.idle.pop_first() {
            return Ok(id);
        }
        let id = WorkerId::from(self.next_id);
        self.next_id += 1;
        let (work_tx, work_rx) = mpsc::channel();
        let ctx = WorkerCtx::new(id, work_rx, self.replies_tx.clone(), self.env.hosts.clone());
        let env = self.env.clone();
        let thread = thread::Builder::new()
            .name(format!("sos-worker-{id}"))
            .spawn(move || worker_loop(env, ctx))
            .context("starting worker thread")?;
        log::debug!("started worker {id}");
        self.workers.insert(
            id,
            Handle {
                work: work_tx,
                thread,
            },
        );
        Ok(id)
    }

    pub fn release(&mut self, id: WorkerId) {
        self.busy.remove(&id);
        self.pending.remove(&id);
        if self.workers.contains_key(&id) {
            self.idle.insert(id);
        }
    }

    pub fn set_pending(&mut self, id: WorkerId) {
        if self.busy.remove(&id) {
            self.pending.insert(id);
        }
    }

    /// Move a pending worker back to busy. Fails when no slot is free, or
    /// when `id` is not pending.
    pub fn set_busy(&mut self, id: WorkerId) -> bool {
        if !self.has_slot() || !self.pending.contains(&id) {
            return false;
        }
        self.pending.remove(&id);
        self.busy.insert(id);
        true
    }

    /// Forget workers whose thread has exited, and return their ids.
    /// Outside of shutdown a worker only exits by panicking.
    pub fn reap(&mut self) -> Vec<WorkerId> {
        let dead: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, h)| h.thread.is_finished())
            .map(|(&id, _)| id)
            .collect();
        for id in &dead {
            self.busy.remove(id);
            self.pending.remove(id);
            self.idle.remove(id);
            if let Some(handle) = self.workers.remove(id) {
                if handle.thread.join().is_err() {
                    log::error!("worker {id} panicked");
                }
            }
        }
        dead
    }

    pub fn send(&self, id: WorkerId, work: Work) -> Result<()> {
        let handle = self
            .workers
            .get(&id)
            .with_context(|| format!("no worker {id}"))?;
        handle
            .work
            .send(work)
            .map_err(|_| anyhow::anyhow!("worker {id} has stopped"))
    }

    /// Wait up to `timeout` for a reply.
    pub fn recv(&self, timeout: Duration) -> Option<(WorkerId, Reply)> {
        match self.replies.recv_timeout(timeout) {
            Ok(reply) => Some(reply),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    pub fn try_recv(&self) -> Option<(WorkerId, Reply)> {
        match self.replies.try_recv() {
            Ok(reply) => Some(reply),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Stop every worker: ask nicely, then signal the processes they run,
    /// first with SIGTERM, then SIGKILL. Each stage waits up to `grace`.
    pub fn shutdown(&mut self, grace: Duration) {
        for handle in self.workers.values() {
            // a worker that already exited has nothing to stop
            let _ = handle.work.send(Work::Stop);
        }
        if !self.wait_finished(grace) {
            let n = self.env.groups.signal_all(libc::SIGTERM);
            log::info!("sent SIGTERM to {n} process groups");
            if !self.wait_finished(grace) {
                let n = self.env.groups.signal_all(libc::SIGKILL);
                log::warn!("sent SIGKILL to {n} process groups");
                self.wait_finished(grace);
            }
        }

        let workers = std::mem::take(&mut self.workers);
        for (id, handle) in workers {
            if handle.thread.is_finished() {
                if handle.thread.join().is_err() {
                    log::error!("worker {id} panicked");
                }
            } else {
                log::warn!("leaving worker {id} behind");
            }
        }
        self.busy.clear();
        self.pending.clear();
        self.idle.clear();
    }

    fn wait_finished(&self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        loop {
            // keep replies flowing so no worker blocks on a full queue
            while self.try_recv().is_some() {}
            if self.workers.values().all(|h| h.thread.is_finished()) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(SHUTDOWN_POLL);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::Arc;

    use crate::exec::evaluator::{StepContext, StepError, StepEvaluator, StepOutput};
    use crate::exec::message::{StepJob, StepReply};
    use crate::exec::run_cmd::ProcessGroups;
    use crate::exec::signature::SignatureStore;
    use crate::exec::tasks::Hosts;
    use crate::fs::Fs;
    use crate::settings::{RunConfig, SigMode};
    use workflow::{Namespace, Workflow};

    struct Noop;

    impl StepEvaluator for Noop {
        fn evaluate(&self, _cx: &StepContext, _ctx: &mut WorkerCtx) -> Result<StepOutput, StepError> {
            Ok(StepOutput::default())
        }
    }

    fn pool(dir: &std::path::Path, max_procs: usize) -> Result<(WorkerPool, StepJob)> {
        let text = "step a_1 {\n}\n";
        let wf = Workflow::load(syntax::parse(text)?, text)?;
        let step = wf.find_step("a_1").context("no step")?;
        let fs = Fs::new(dir);
        let env = WorkerEnv {
            wf: Arc::new(wf),
            config: RunConfig {
                sig_mode: SigMode::Ignore,
                ..Default::default()
            },
            signatures: SignatureStore::new(fs.sig_dir()),
            fs,
            evaluator: Arc::new(Noop),
            hosts: Hosts::default(),
            groups: ProcessGroups::default(),
        };
        let job = StepJob {
            step,
            label: "a_1 (0)".to_owned(),
            stem: "a_1".to_owned(),
            inputs: Default::default(),
            depends: Default::default(),
            outputs: Default::default(),
            vars: Namespace::new(),
            signature_vars: Default::default(),
        };
        Ok((WorkerPool::new(env, max_procs), job))
    }

    #[test]
    fn test_slots() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut pool, _) = pool(dir.path(), 2)?;
        let a = pool.acquire()?.context("slot")?;
        let b = pool.acquire()?.context("slot")?;
        assert_eq!(None, pool.acquire()?);

        // pending workers free their slot:
        pool.set_pending(a);
        let c = pool.acquire()?.context("slot")?;
        assert_eq!(3, pool.len());
        assert!(!pool.has_slot());

        pool.release(b);
        assert!(pool.set_busy(a));
        assert_eq!(2, pool.busy_count());
        // released workers are reused, lowest id first:
        pool.release(c);
        assert_eq!(Some(b), pool.acquire()?);
        assert_eq!(3, pool.len());
        pool.shutdown(Duration::from_secs(1));
        assert!(pool.is_empty());
        Ok(())
    }

    #[test]
    fn test_resuming_respects_cap() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut pool, _) = pool(dir.path(), 1)?;
        let a = pool.acquire()?.context("slot")?;
        pool.set_pending(a);
        let b = pool.acquire()?.context("slot")?;

        // a's tasks finished while b holds the only slot:
        assert!(!pool.set_busy(a));
        assert_eq!(1, pool.busy_count());

        pool.release(b);
        assert!(pool.set_busy(a));
        assert_eq!(1, pool.busy_count());
        assert!(!pool.has_slot());
        pool.shutdown(Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn test_reap_exited_worker() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut pool, _) = pool(dir.path(), 2)?;
        let a = pool.acquire()?.context("slot")?;
        let b = pool.acquire()?.context("slot")?;
        pool.send(a, Work::Stop)?;

        let deadline = Instant::now() + Duration::from_secs(5);
        let mut dead = Vec::new();
        while dead.is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
            dead = pool.reap();
        }
        assert_eq!(vec![a], dead);
        assert_eq!(1, pool.len());
        assert_eq!(1, pool.busy_count());

        // a released dead worker is never handed out again:
        pool.release(a);
        let c = pool.acquire()?.context("slot")?;
        assert!(c != a && c != b);
        pool.shutdown(Duration::from_secs(1));
        Ok(())
    }

    #[test]
    fn test_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let (mut pool, job) = pool(dir.path(), 1)?;
        let id = pool.acquire()?.context("slot")?;
        pool.send(id, Work::Step(Box::new(job)))?;
        match pool.recv(Duration::from_secs(5)) {
            Some((from, Reply::Step(StepReply::Done(_)))) => assert_eq!(id, from),
            other => panic!("unexpected {other:?}"),
        }
        pool.shutdown(Duration::from_secs(1));
        Ok(())
    }
}

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use workflow::{Namespace, StepDescriptor};

use super::Error;

/// Consecutive failed polls of a host before its tasks count as failed.
pub const MAX_HOST_FAILURES: u32 = 3;

/// Status of an offloaded task.
///
/// Statuses only move forward:
/// `pending -> submitted -> running -> (completed | failed | aborted | signature-mismatch)`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    #[default]
    Pending,
    Submitted,
    Running,
    Completed,
    Failed,
    Aborted,
    SignatureMismatch,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Submitted => "submitted",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
            Self::SignatureMismatch => "signature-mismatch",
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Submitted => 1,
            Self::Running => 2,
            _ => 3,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.rank() == 3
    }

    /// Terminal, and not completed.
    pub fn is_bad(&self) -> bool {
        self.is_terminal() && *self != Self::Completed
    }

    /// The status after observing `seen` on the host;
    /// backwards moves are ignored.
    pub fn advance(self, seen: Self) -> Self {
        if self.is_terminal() || seen.rank() < self.rank() {
            self
        } else {
            seen
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = match s.trim() {
            "pending" => Self::Pending,
            "submitted" => Self::Submitted,
            "running" => Self::Running,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "aborted" => Self::Aborted,
            "signature-mismatch" => Self::SignatureMismatch,
            other => return Err(Error::UnknownTaskStatus(other.to_owned())),
        };
        Ok(status)
    }
}

/// A unit of work to offload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// stable across runs for the same step and script, so a resumed run
    /// finds the tasks it submitted before
    pub id: String,
    pub step: String,
    pub script: String,
    pub workdir: PathBuf,
}

impl TaskSpec {
    pub fn new(step: &StepDescriptor, stem: &str, script: String, workdir: PathBuf) -> Self {
        let mut hasher = blake3::Hasher::new();
        hasher.update(step.uuid.as_bytes());
        hasher.update(stem.as_bytes());
        hasher.update(script.as_bytes());
        let hex = hasher.finalize().to_hex();
        Self {
            id: format!("t{}", &hex.as_str()[..15]),
            step: step.name.clone(),
            script,
            workdir,
        }
    }
}

/// What a finished task hands back to the step that submitted it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskResult {
    pub id: String,
    pub stdout: String,
    /// `name=value` lines the task wrote to `$SOS_SHARED`
    pub shared: Namespace,
}

/// An external place to run tasks.
pub trait TaskHost: Send + Sync {
    fn name(&self) -> &str;

    /// Start running `task`. Submitting a task the host already knows is a no-op.
    fn submit_task(&self, task: &TaskSpec) -> Result<()>;

    /// One status per id, in order.
    fn check_status(&self, ids: &[String]) -> Result<Vec<TaskStatus>>;

    /// Results of finished tasks, in order.
    fn retrieve_results(&self, ids: &[String], timeout: Duration) -> Result<Vec<TaskResult>>;

    /// Whether to keep polling when nothing but this host's tasks is left.
    fn wait_for_task(&self) -> bool {
        true
    }
}

/// Task hosts by name.
#[derive(Clone, Default)]
pub struct Hosts {
    hosts: BTreeMap<String, Arc<dyn TaskHost>>,
}

impl fmt::Debug for Hosts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.hosts.keys()).finish()
    }
}

impl Hosts {
    pub fn add(&mut self, host: Arc<dyn TaskHost>) {
        self.hosts.insert(host.name().to_owned(), host);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn TaskHost>, Error> {
        self.hosts
            .get(name)
            .ok_or_else(|| Error::UnknownHost(name.to_owned()))
    }
}

/// Result of polling a [`TaskWait`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Poll {
    Waiting,
    Completed,
    Failed(String),
}

/// Tasks a worker is blocked on, and what we have seen of them so far.
#[derive(Debug, Clone)]
pub struct TaskWait {
    pub host: String,
    pub ids: Vec<String>,
    statuses: Vec<TaskStatus>,
    failures: u32,
}

impl TaskWait {
    pub fn new(host: String, ids: Vec<String>) -> Self {
        let statuses = vec![TaskStatus::Pending; ids.len()];
        Self {
            host,
            ids,
            statuses,
            failures: 0,
        }
    }

    pub fn statuses(&self) -> &[TaskStatus] {
        &self.statuses
    }

    /// Ask the host how the tasks are doing.
    pub fn poll(&mut self, host: &dyn TaskHost) -> Poll {
        let seen = match host.check_status(&self.ids) {
            Ok(seen) if seen.len() == self.ids.len() => seen,
            Ok(seen) => {
                return self.unreachable(format!(
                    "expected {} statuses, got {}",
                    self.ids.len(),
                    seen.len()
                ))
            }
            Err(e) => return self.unreachable(format!("{e:#}")),
        };
        self.failures = 0;
        for (status, seen) in self.statuses.iter_mut().zip(seen) {
            let next = status.advance(seen);
            if next != seen {
                log::debug!("ignoring task status {seen} after {status}");
            }
            *status = next;
        }

        let bad = self
            .ids
            .iter()
            .zip(&self.statuses)
            .find(|(_, status)| status.is_bad());
        if let Some((id, status)) = bad {
            return Poll::Failed(format!("task {id} on {} {status}", self.host));
        }
        if self.statuses.iter().all(|s| *s == TaskStatus::Completed) {
            Poll::Completed
        } else {
            Poll::Waiting
        }
    }

    fn unreachable(&mut self, msg: String) -> Poll {
        self.failures += 1;
        log::warn!(
            "polling host {} failed ({}/{MAX_HOST_FAILURES}): {msg}",
            self.host,
            self.failures
        );
        if self.failures >= MAX_HOST_FAILURES {
            Poll::Failed(format!(
                "host {} unreachable after {} attempts: {msg}",
                self.host, self.failures
            ))
        } else {
            Poll::Waiting
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::sync::Mutex;

    /// A host that replays scripted status lists, one per poll.
    pub struct ScriptedHost {
        pub name: String,
        pub polls: Mutex<Vec<Result<Vec<TaskStatus>, String>>>,
        pub submitted: Mutex<Vec<String>>,
        pub wait: bool,
    }

    impl ScriptedHost {
        pub fn new(name: &str, polls: Vec<Result<Vec<TaskStatus>, String>>) -> Self {
            Self {
                name: name.to_owned(),
                polls: Mutex::new(polls.into_iter().rev().collect()),
                submitted: Mutex::new(Vec::new()),
                wait: true,
            }
        }
    }

    impl TaskHost for ScriptedHost {
        fn name(&self) -> &str {
            &self.name
        }
        fn submit_task(&self, task: &TaskSpec) -> Result<()> {
            self.submitted.lock().unwrap().push(task.id.clone());
            Ok(())
        }
        fn check_status(&self, ids: &[String]) -> Result<Vec<TaskStatus>> {
            match self.polls.lock().unwrap().pop() {
                Some(Ok(statuses)) => Ok(statuses),
                Some(Err(e)) => Err(anyhow::anyhow!(e)),
                None => Ok(vec![TaskStatus::Running; ids.len()]),
            }
        }
        fn retrieve_results(&self, ids: &[String], _timeout: Duration) -> Result<Vec<TaskResult>> {
            Ok(ids
                .iter()
                .map(|id| TaskResult {
                    id: id.clone(),
                    ..Default::default()
                })
                .collect())
        }
        fn wait_for_task(&self) -> bool {
            self.wait
        }
    }

    use TaskStatus::*;

    #[test]
    fn test_status_is_monotonic() {
        assert_eq!(Running, Submitted.advance(Running));
        assert_eq!(Running, Running.advance(Pending));
        assert_eq!(Completed, Completed.advance(Running));
        assert_eq!(Completed, Completed.advance(Failed));
        assert_eq!(Aborted, Running.advance(Aborted));
        assert!(SignatureMismatch.is_bad());
        assert!(!Completed.is_bad());
        assert_eq!(SignatureMismatch, "signature-mismatch\n".parse::<TaskStatus>().unwrap());
        assert!("bogus".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_poll_until_completed() {
        let host = ScriptedHost::new(
            "h",
            vec![
                Ok(vec![Pending, Running]),
                Ok(vec![Completed, Submitted]),
                Ok(vec![Running, Running]),
                Ok(vec![Completed, Completed]),
            ],
        );
        let mut wait = TaskWait::new("h".to_owned(), vec!["a".to_owned(), "b".to_owned()]);
        assert_eq!(Poll::Waiting, wait.poll(&host));
        assert_eq!(Poll::Waiting, wait.poll(&host));
        // "b" went backwards from running; "a" stays completed:
        assert_eq!(&[Completed, Running], wait.statuses());
        assert_eq!(Poll::Waiting, wait.poll(&host));
        assert_eq!(Poll::Completed, wait.poll(&host));
    }

    #[test]
    fn test_poll_bad_status() {
        let host = ScriptedHost::new("h", vec![Ok(vec![Running, Aborted])]);
        let mut wait = TaskWait::new("h".to_owned(), vec!["a".to_owned(), "b".to_owned()]);
        match wait.poll(&host) {
            Poll::Failed(msg) => assert!(msg.contains("task b on h aborted")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_host_unreachable_budget() {
        let down = || Err("connection refused".to_owned());
        let host = ScriptedHost::new("h", vec![down(), down(), Ok(vec![Running]), down(), down(), down()]);
        let mut wait = TaskWait::new("h".to_owned(), vec!["a".to_owned()]);
        assert_eq!(Poll::Waiting, wait.poll(&host));
        assert_eq!(Poll::Waiting, wait.poll(&host));
        // a good poll resets the budget:
        assert_eq!(Poll::Waiting, wait.poll(&host));
        assert_eq!(Poll::Waiting, wait.poll(&host));
        assert_eq!(Poll::Waiting, wait.poll(&host));
        assert!(matches!(wait.poll(&host), Poll::Failed(msg) if msg.contains("unreachable")));
    }
}

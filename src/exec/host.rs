use std::io::ErrorKind;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};

use super::shell::read_shared;
use super::tasks::{TaskHost, TaskResult, TaskSpec, TaskStatus};
use crate::fs::write_atomic;

/// Runs the task script, recording its progress in the status file ($1).
/// Status updates go through a rename so readers never see a partial write.
const WRAPPER: &str = r#"set_status() { echo "$1" > "$STATUS.tmp" && mv "$STATUS.tmp" "$STATUS"; }
STATUS="$1"
set_status running
if bash "$2" > "$3" 2> "$4"; then set_status completed; else set_status failed; fi
"#;

const RESULT_POLL: Duration = Duration::from_millis(50);

/// Runs tasks as detached process groups on this machine.
///
/// Everything about a task lives in `<dir>/<id>.*`, so a later run can
/// pick up tasks started by an earlier one.
#[derive(Debug, Clone)]
pub struct LocalHost {
    dir: PathBuf,
    wait: bool,
}

impl LocalHost {
    pub const NAME: &'static str = "local";

    pub fn new(dir: PathBuf) -> Self {
        Self { dir, wait: true }
    }

    /// Whether the run should keep waiting on this host's tasks.
    pub fn with_wait(mut self, wait: bool) -> Self {
        self.wait = wait;
        self
    }

    fn path(&self, id: &str, ext: &str) -> PathBuf {
        self.dir.join(format!("{id}.{ext}"))
    }

    fn read_status(&self, id: &str) -> Result<TaskStatus> {
        let path = self.path(id, "status");
        match std::fs::read_to_string(&path) {
            Ok(text) => Ok(text.parse()?),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(TaskStatus::Pending),
            Err(e) => Err(e).with_context(|| format!("reading {}", path.display())),
        }
    }

    fn wait_for_file(path: &Path, deadline: Instant) -> Result<()> {
        while !path.exists() {
            if Instant::now() >= deadline {
                anyhow::bail!("timed out waiting for {}", path.display());
            }
            thread::sleep(RESULT_POLL);
        }
        Ok(())
    }
}

impl TaskHost for LocalHost {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn submit_task(&self, task: &TaskSpec) -> Result<()> {
        let status = self.path(&task.id, "status");
        if status.exists() {
            log::debug!("task {} already submitted", task.id);
            return Ok(());
        }
        std::fs::create_dir_all(&self.dir).with_context(|| format!("creating {:?}", self.dir))?;
        let script = self.path(&task.id, "sh");
        std::fs::write(&script, &task.script).with_context(|| format!("writing {script:?}"))?;
        write_atomic(&status, TaskStatus::Submitted.as_str())?;

        let spawned = Command::new("bash")
            .arg("-c")
            .arg(WRAPPER)
            .arg("sos-task")
            .arg(&status)
            .arg(&script)
            .arg(self.path(&task.id, "out"))
            .arg(self.path(&task.id, "err"))
            .current_dir(&task.workdir)
            .env("SOS_SHARED", self.path(&task.id, "shared"))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn();
        let mut child = match spawned {
            Ok(child) => child,
            Err(e) => {
                // without a status file, submitting again starts it for real
                if let Err(rm) = std::fs::remove_file(&status) {
                    log::warn!("removing {status:?}: {rm}");
                }
                return Err(e).with_context(|| format!("starting task {}", task.id));
            }
        };
        log::info!("submitted task {} for step {} (pid {})", task.id, task.step, child.id());

        // the task outlives nothing of ours, but shouldn't linger as a zombie.
        let id = task.id.clone();
        thread::spawn(move || match child.wait() {
            Ok(status) => log::debug!("task {id} exited with {status}"),
            Err(e) => log::warn!("lost track of task {id}: {e}"),
        });
        Ok(())
    }

    fn check_status(&self, ids: &[String]) -> Result<Vec<TaskStatus>> {
        ids.iter().map(|id| self.read_status(id)).collect()
    }

    fn retrieve_results(&self, ids: &[String], timeout: Duration) -> Result<Vec<TaskResult>> {
        let deadline = Instant::now() + timeout;
        let mut results = Vec::with_capacity(ids.len());
        for id in ids {
            let out = self.path(id, "out");
            Self::wait_for_file(&out, deadline)?;
            results.push(TaskResult {
                id: id.clone(),
                stdout: std::fs::read_to_string(&out)
                    .with_context(|| format!("reading {}", out.display()))?,
                shared: read_shared(&self.path(id, "shared"))?,
            });
        }
        Ok(results)
    }

    fn wait_for_task(&self) -> bool {
        self.wait
    }
}

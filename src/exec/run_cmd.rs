use std::collections::BTreeSet;
use std::fs::File;
use std::io::{self, stderr, stdout, Read, Write};
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use anyhow::{Context, Result};

use super::Error;

/// Process groups of running children, so shutdown can reach them.
#[derive(Debug, Clone, Default)]
pub struct ProcessGroups(Arc<Mutex<BTreeSet<i32>>>);

impl ProcessGroups {
    fn groups(&self) -> MutexGuard<'_, BTreeSet<i32>> {
        // a panicked holder can't leave the set half-updated:
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn insert(&self, pgid: i32) {
        self.groups().insert(pgid);
    }

    pub fn remove(&self, pgid: i32) {
        self.groups().remove(&pgid);
    }

    pub fn len(&self) -> usize {
        self.groups().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Send `signal` to every live group. Returns how many were signalled.
    pub fn signal_all(&self, signal: i32) -> usize {
        let groups = self.groups();
        for &pgid in groups.iter() {
            log::debug!("sending signal {signal} to process group {pgid}");
            // SAFETY: killpg has no memory-safety preconditions; a stale
            // pgid just makes it return ESRCH.
            unsafe {
                libc::killpg(pgid, signal);
            }
        }
        groups.len()
    }
}

/// Run a subprocess in its own process group, storing stdout and stderr in
/// `out` and `err`, and echoing them to ours if `echo` is set.
/// Based on:
/// <https://stackoverflow.com/questions/66060139/how-to-tee-stdout-stderr-from-a-subprocess-in-rust>
pub fn run_cmd(
    cmd: &mut Command,
    out: &Path,
    err: &Path,
    echo: bool,
    groups: &ProcessGroups,
) -> Result<ExitStatus> {
    let out_file = File::create(out).with_context(|| format!("creating {out:?}"))?;
    let err_file = File::create(err).with_context(|| format!("creating {err:?}"))?;

    let mut child = cmd
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .process_group(0)
        .spawn()
        .with_context(|| {
            format!(
                "failed to execute child process {:?} {:?}",
                cmd.get_program(),
                cmd.get_args().collect::<Vec<_>>(),
            )
        })?;
    let pgid = child.id() as i32;
    groups.insert(pgid);

    let child_out = child.stdout.take().ok_or(Error::ChildPipe("stdout"))?;
    let child_err = child.stderr.take().ok_or(Error::ChildPipe("stderr"))?;

    let thread_out = thread::spawn(move || communicate(child_out, out_file, echo.then(stdout)));
    let thread_err = thread::spawn(move || communicate(child_err, err_file, echo.then(stderr)));

    let status = child.wait();
    groups.remove(pgid);

    thread_out
        .join()
        .map_err(|_| Error::ChildPipe("stdout"))?
        .context("error communicating with child stdout")?;
    thread_err
        .join()
        .map_err(|_| Error::ChildPipe("stderr"))?
        .context("error communicating with child stderr")?;

    Ok(status.context("failed to wait on child process")?)
}

fn communicate<R: Read, W: Write>(
    mut stream: R,
    mut file: File,
    mut output: Option<W>,
) -> io::Result<()> {
    let mut buf = [0u8; 1024];
    loop {
        let num_read = stream.read(&mut buf)?;
        if num_read == 0 {
            break;
        }

        let buf = &buf[..num_read];
        file.write_all(buf)?;
        if let Some(output) = output.as_mut() {
            output.write_all(buf)?;
        }
    }

    Ok(())
}

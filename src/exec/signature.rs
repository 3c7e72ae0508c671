use std::collections::BTreeMap;
use std::fs::OpenOptions;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use workflow::{ExistKind, Namespace, Target, TargetEnv};

use crate::fs::{remove_if_exists, write_atomic};

/// Stored record of a step's last successful run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepSignature {
    /// digest of the step definition
    pub digest: String,
    /// values of the signature variables
    pub vars: Namespace,
    /// target -> hex fingerprint
    pub inputs: BTreeMap<String, String>,
    pub outputs: BTreeMap<String, String>,
    /// variables the step shared
    pub shared: Namespace,
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn fingerprints(targets: &[Target], env: &dyn TargetEnv) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for target in targets {
        if let Target::Custom(_) = target {
            continue;
        }
        out.insert(target.to_string(), hex(&target.fingerprint(env)?));
    }
    Ok(out)
}

/// Inverse of `Target`'s `Display`, for the kinds we store.
fn parse_saved(text: &str) -> Option<Target> {
    let (kind, name) = text.split_once(':')?;
    match kind {
        "file" => Some(Target::file(name)),
        "step" => Some(Target::step(name)),
        "var" => Some(Target::var(name)),
        _ => None,
    }
}

impl StepSignature {
    /// Fingerprint the step's current inputs and outputs.
    pub fn compute(
        digest: &str,
        vars: Namespace,
        inputs: &[Target],
        outputs: &[Target],
        shared: Namespace,
        env: &dyn TargetEnv,
    ) -> Result<Self> {
        Ok(Self {
            digest: digest.to_owned(),
            vars,
            inputs: fingerprints(inputs, env)?,
            outputs: fingerprints(outputs, env)?,
            shared,
        })
    }

    /// Why the signature no longer holds, or `None` if it does.
    pub fn check(
        &self,
        digest: &str,
        vars: &Namespace,
        inputs: &[Target],
        env: &dyn TargetEnv,
    ) -> Result<Option<String>> {
        if self.digest != digest {
            return Ok(Some("step definition changed".to_owned()));
        }
        if self.vars != *vars {
            return Ok(Some("variables changed".to_owned()));
        }
        let current = inputs.iter().filter(|t| !matches!(t, Target::Custom(_)));
        if current.clone().count() != self.inputs.len() {
            return Ok(Some("inputs changed".to_owned()));
        }
        for target in current {
            if !target.exists(ExistKind::Target, env)? {
                return Ok(Some(format!("input {target} is missing")));
            }
            let saved = self.inputs.get(&target.to_string());
            if saved != Some(&hex(&target.fingerprint(env)?)) {
                return Ok(Some(format!("input {target} changed")));
            }
        }
        for (name, saved) in &self.outputs {
            let Some(target) = parse_saved(name) else {
                return Ok(Some(format!("unreadable output {name}")));
            };
            if !target.exists(ExistKind::Target, env)? {
                return Ok(Some(format!("output {target} is missing")));
            }
            if *saved != hex(&target.fingerprint(env)?) {
                return Ok(Some(format!("output {target} changed")));
            }
        }
        Ok(None)
    }

    /// Outputs the signature was recorded with.
    pub fn output_targets(&self) -> Vec<Target> {
        self.outputs.keys().filter_map(|k| parse_saved(k)).collect()
    }
}

/// Result of trying to take a step lock.
#[derive(Debug)]
pub enum LockAttempt {
    Acquired(SigLock),
    /// another live process holds the lock file at this path
    Busy(PathBuf),
}

/// Held lock on a step's outputs; released on drop.
#[derive(Debug)]
pub struct SigLock {
    path: PathBuf,
}

impl Drop for SigLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            log::warn!("couldn't release lock {}: {e}", self.path.display());
        }
    }
}

fn pid_alive(pid: i32) -> bool {
    // SAFETY: signal 0 performs only the existence and permission check.
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Signatures live under `.sos/sig`:
/// `targets/<hash>.sig`, `steps/<stem>.json` and `locks/<stem>.lock`.
#[derive(Debug, Clone)]
pub struct SignatureStore {
    dir: PathBuf,
}

impl SignatureStore {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn target_path(&self, target: &Target) -> PathBuf {
        let hash = blake3::hash(target.to_string().as_bytes());
        self.dir
            .join("targets")
            .join(format!("{}.sig", &hash.to_hex().as_str()[..32]))
    }

    fn step_path(&self, stem: &str) -> PathBuf {
        self.dir.join("steps").join(format!("{stem}.json"))
    }

    fn lock_path(&self, stem: &str) -> PathBuf {
        self.dir.join("locks").join(format!("{stem}.lock"))
    }

    pub fn load(&self, stem: &str) -> Result<Option<StepSignature>> {
        let path = self.step_path(stem);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("reading {}", path.display())),
        };
        match serde_json::from_str(&text) {
            Ok(sig) => Ok(Some(sig)),
            Err(e) => {
                log::warn!("ignoring corrupt signature {}: {e}", path.display());
                Ok(None)
            }
        }
    }

    pub fn save(&self, stem: &str, sig: &StepSignature) -> Result<()> {
        let path = self.step_path(stem);
        create_parent(&path)?;
        write_atomic(&path, &serde_json::to_string_pretty(sig)?)
    }

    pub fn remove(&self, stem: &str) -> Result<()> {
        remove_if_exists(&self.step_path(stem))
    }

    /// Record the fingerprint of a produced target.
    pub fn save_target(&self, target: &Target, env: &dyn TargetEnv) -> Result<()> {
        let path = self.target_path(target);
        create_parent(&path)?;
        write_atomic(&path, &hex(&target.fingerprint(env)?))
    }

    /// Take the lock for `stem`, clearing it first if its holder is gone.
    pub fn lock(&self, stem: &str) -> Result<LockAttempt> {
        let path = self.lock_path(stem);
        create_parent(&path)?;
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    return Ok(LockAttempt::Acquired(SigLock { path }));
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    let holder = std::fs::read_to_string(&path)
                        .ok()
                        .and_then(|pid| pid.trim().parse::<i32>().ok());
                    match holder {
                        Some(pid) if pid as u32 == std::process::id() || pid_alive(pid) => {
                            return Ok(LockAttempt::Busy(path));
                        }
                        _ => {
                            log::debug!("removing stale lock {}", path.display());
                            remove_if_exists(&path)?;
                        }
                    }
                }
                Err(e) => return Err(e).with_context(|| format!("locking {}", path.display())),
            }
        }
        Ok(LockAttempt::Busy(path))
    }
}

fn create_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {parent:?}"))?;
    }
    Ok(())
}

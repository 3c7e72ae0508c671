use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;

/// What to check for in [`Target::exists`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExistKind {
    Target,
    Signature,
}

/// What to delete in [`Target::remove`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoveKind {
    Target,
    Signature,
    Both,
}

impl RemoveKind {
    fn target(self) -> bool {
        matches!(self, Self::Target | Self::Both)
    }

    fn signature(self) -> bool {
        matches!(self, Self::Signature | Self::Both)
    }
}

/// The run state a target is checked against.
pub trait TargetEnv {
    /// Directory relative file targets live in.
    fn root(&self) -> &Path;
    /// Has the named step completed in this run?
    fn step_completed(&self, name: &str) -> bool;
    /// Look up a variable in the shared namespace.
    fn variable(&self, name: &str) -> Option<&Value>;
    /// Where the stored fingerprint of `target` lives.
    fn signature_path(&self, target: &Target) -> PathBuf;
    /// Forget that the named step completed.
    fn reset_step(&mut self, name: &str);
    /// Remove a variable from the shared namespace.
    fn unset_variable(&mut self, name: &str);
}

/// A user-defined target with its own notion of existence.
pub trait CustomTarget: fmt::Debug + Send + Sync {
    /// Short type name, used as the display prefix.
    fn kind(&self) -> &str;
    /// Canonical identity; two custom targets of the same kind are equal iff these are equal.
    fn identity(&self) -> String;
    fn exists(&self, kind: ExistKind) -> Result<bool>;
    fn remove(&self, kind: RemoveKind) -> Result<()>;
    fn fingerprint(&self) -> Result<Vec<u8>>;
}

/// Something a step can consume or produce.
#[derive(Debug, Clone)]
pub enum Target {
    /// A file, identified by its lexically normalized relative path.
    File(PathBuf),
    /// Completion of a named step.
    Step(String),
    /// A variable in the shared namespace.
    Var(String),
    Custom(Arc<dyn CustomTarget>),
}

impl Target {
    /// Create a file target, normalizing the path.
    pub fn file(path: impl AsRef<Path>) -> Self {
        Self::File(normalize(path.as_ref()))
    }

    pub fn step(name: impl Into<String>) -> Self {
        Self::Step(name.into())
    }

    pub fn var(name: impl Into<String>) -> Self {
        Self::Var(name.into())
    }

    pub fn is_file(&self) -> bool {
        matches!(self, Self::File(_))
    }

    fn rank(&self) -> u8 {
        match self {
            Self::File(_) => 0,
            Self::Step(_) => 1,
            Self::Var(_) => 2,
            Self::Custom(_) => 3,
        }
    }

    /// Canonical identity within the variant.
    pub fn identity(&self) -> String {
        match self {
            Self::File(path) => path.to_string_lossy().into_owned(),
            Self::Step(name) | Self::Var(name) => name.clone(),
            Self::Custom(custom) => format!("{}:{}", custom.kind(), custom.identity()),
        }
    }

    pub fn exists(&self, kind: ExistKind, env: &dyn TargetEnv) -> Result<bool> {
        match (self, kind) {
            (Self::Custom(custom), kind) => custom.exists(kind),
            (_, ExistKind::Signature) => Ok(env.signature_path(self).exists()),
            (Self::File(path), ExistKind::Target) => {
                let path = env.root().join(path);
                path.try_exists()
                    .with_context(|| format!("checking for {}", path.display()))
            }
            (Self::Step(name), ExistKind::Target) => Ok(env.step_completed(name)),
            (Self::Var(name), ExistKind::Target) => Ok(env.variable(name).is_some()),
        }
    }

    /// Remove the target and/or its signature. Missing artifacts are not an error.
    pub fn remove(&self, kind: RemoveKind, env: &mut dyn TargetEnv) -> Result<()> {
        if kind.target() {
            match self {
                Self::File(path) => remove_if_present(&env.root().join(path))?,
                Self::Step(name) => env.reset_step(name),
                Self::Var(name) => env.unset_variable(name),
                Self::Custom(custom) => return custom.remove(kind),
            }
        }
        if kind.signature() {
            if let Self::Custom(custom) = self {
                return custom.remove(kind);
            }
            remove_if_present(&env.signature_path(self))?;
        }
        Ok(())
    }

    /// Deterministic fingerprint of the target's current state.
    pub fn fingerprint(&self, env: &dyn TargetEnv) -> Result<Vec<u8>> {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.to_string().as_bytes());
        match self {
            Self::File(path) => {
                let path = env.root().join(path);
                let file = std::fs::File::open(&path)
                    .with_context(|| format!("fingerprinting {}", path.display()))?;
                hasher.update_reader(file)?;
            }
            Self::Step(name) => {
                hasher.update(&[env.step_completed(name) as u8]);
            }
            Self::Var(name) => {
                let val = env.variable(name).cloned().unwrap_or(Value::Null);
                hasher.update(val.to_string().as_bytes());
            }
            Self::Custom(custom) => return custom.fingerprint(),
        }
        Ok(hasher.finalize().as_bytes().to_vec())
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("removing {}", path.display())),
    }
}

/// Lexical normalization: drop `.`, fold `..`, keep roots.
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => (),
            Component::ParentDir => {
                if matches!(out.components().next_back(), Some(Component::Normal(_))) {
                    out.pop();
                } else {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.rank() == other.rank() && self.identity() == other.identity()
    }
}

impl Eq for Target {}

impl Hash for Target {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Self::File(path) => path.hash(state),
            Self::Step(name) | Self::Var(name) => name.hash(state),
            Self::Custom(_) => self.identity().hash(state),
        }
    }
}

impl PartialOrd for Target {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Target {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank()
            .cmp(&other.rank())
            .then_with(|| self.identity().cmp(&other.identity()))
    }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "file:{}", path.display()),
            Self::Step(name) => write!(f, "step:{name}"),
            Self::Var(name) => write!(f, "var:{name}"),
            Self::Custom(custom) => write!(f, "custom:{}:{}", custom.kind(), custom.identity()),
        }
    }
}

/// A list of targets, or a marker that the step computes them at runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetSet {
    Determined(Vec<Target>),
    Undetermined,
}

impl Default for TargetSet {
    fn default() -> Self {
        Self::Determined(Vec::with_capacity(0))
    }
}

impl TargetSet {
    /// Concrete targets; an undetermined set has none.
    pub fn targets(&self) -> &[Target] {
        match self {
            Self::Determined(targets) => targets,
            Self::Undetermined => &[],
        }
    }

    pub fn is_undetermined(&self) -> bool {
        matches!(self, Self::Undetermined)
    }

    /// True if the set is undetermined or has no targets.
    pub fn is_empty(&self) -> bool {
        self.targets().is_empty()
    }

    pub fn contains(&self, target: &Target) -> bool {
        self.targets().contains(target)
    }

    /// Add a target, fixing an undetermined set. Duplicates are ignored.
    pub fn push(&mut self, target: Target) {
        match self {
            Self::Determined(targets) => {
                if !targets.contains(&target) {
                    targets.push(target);
                }
            }
            Self::Undetermined => *self = Self::Determined(vec![target]),
        }
    }
}

impl FromIterator<Target> for TargetSet {
    fn from_iter<I: IntoIterator<Item = Target>>(iter: I) -> Self {
        let mut set = Self::default();
        for target in iter {
            set.push(target);
        }
        set
    }
}

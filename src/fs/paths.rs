use std::path::{Path, PathBuf};

use super::Fs;

pub const RUNTIME_DIR: &str = ".sos";

/// Utility fns for making common paths in the runtime directory.
impl Fs {
    /// $WORKDIR/.sos
    pub fn runtime_dir(&self) -> &Path {
        &self.runtime
    }

    /// $WORKDIR/.sos/sig
    pub fn sig_dir(&self) -> PathBuf {
        self.runtime.join("sig")
    }

    /// $WORKDIR/.sos/steps
    pub fn steps_dir(&self) -> PathBuf {
        self.runtime.join("steps")
    }

    /// $WORKDIR/.sos/tasks
    pub fn tasks_dir(&self) -> PathBuf {
        self.runtime.join("tasks")
    }

    /// $WORKDIR/.sos/<fingerprint>.status
    pub fn journal(&self, fingerprint: &str) -> PathBuf {
        parts2(&self.runtime, format!("{fingerprint}.status"))
    }

    /// $WORKDIR/.sos/report.jsonl
    pub fn default_report(&self) -> PathBuf {
        parts2(&self.runtime, "report.jsonl")
    }

    /// $WORKDIR/.sos/steps/<stem>.<ext>
    pub fn step_file(&self, stem: &str, ext: &str) -> PathBuf {
        parts2(self.steps_dir(), format!("{stem}.{ext}"))
    }
}

fn parts2<T, U>(p1: T, p2: U) -> PathBuf
where
    T: AsRef<Path>,
    U: AsRef<Path>,
{
    let mut buf = PathBuf::with_capacity(p1.as_ref().as_os_str().len() + 32);
    buf.push(p1);
    buf.push(p2);
    buf
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_paths() {
        let fs = Fs::new(Path::new("/work"));
        assert_eq!(Path::new("/work/.sos/abc.status"), fs.journal("abc"));
        assert_eq!(Path::new("/work/.sos/steps/a_1.out"), fs.step_file("a_1", "out"));
        assert_eq!(Path::new("/work/.sos/report.jsonl"), fs.default_report());
    }
}

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use util::PathEncodingError;

/// Utility fns
mod ops;
pub use ops::{append_line, remove_if_exists, write_atomic};

/// Defines fns for creating common paths in the runtime directory
mod paths;

/// The resume journal
mod journal;
pub use journal::{Journal, JournalEntry};

/// Run records
mod report;
pub use report::{Report, RunRecord};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Working directory \"{0}\" is not a directory")]
    NotDirectory(String),
    #[error("Can't perform IO operation: \"{0}\" is outside the working directory")]
    NotWhitelisted(String),
    #[error("Invalid journal line {0}: \"{1}\"")]
    InvalidJournal(usize, String),
}

/// All file operations on the runtime directory go through this struct.
///
/// Destructive operations check that the path in question is inside the
/// working directory, otherwise they will not be performed.
/// Step bodies can still do whatever they like.
#[derive(Debug, Clone)]
pub struct Fs {
    /// The directory steps run in, and the only one we modify
    workdir: PathBuf,
    /// `workdir/.sos`
    runtime: PathBuf,
}

impl Fs {
    /// Create a new `Fs` rooted at `workdir`.
    pub fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
            runtime: workdir.join(paths::RUNTIME_DIR),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Check that the working directory exists, and create the runtime
    /// directory tree inside it.
    pub fn ensure_runtime_dirs(&mut self, verbose: bool) -> Result<()> {
        if !self.workdir.is_dir() {
            return Err(Error::NotDirectory(
                self.workdir.to_str().ok_or(PathEncodingError)?.to_owned(),
            )
            .into());
        }
        self.workdir = self.workdir.canonicalize()?;
        self.runtime = self.workdir.join(paths::RUNTIME_DIR);

        for dir in [self.sig_dir(), self.steps_dir(), self.tasks_dir()] {
            if !dir.exists() {
                if verbose {
                    eprintln!("Creating {dir:?}");
                }
                fs::create_dir_all(&dir).with_context(|| format!("creating {dir:?}"))?;
            }
        }
        Ok(())
    }

    /// Check if path exists on disk.
    pub fn exists<T: AsRef<Path>>(&self, path: T) -> bool {
        let path = path.as_ref();
        path.exists() || path.is_symlink()
    }

    /// Create parent directory of a given path.
    pub fn create_parent_dir<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            self.check_whitelist(parent)?;
            fs::create_dir_all(parent).context("creating parent dir")?;
        }
        Ok(())
    }

    /// Create a file, and return a writable `File` handle.
    pub fn create_file<T: AsRef<Path>>(&self, path: T) -> Result<fs::File> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        let f = fs::File::create(path).with_context(|| format!("creating file {path:?}"))?;
        Ok(f)
    }

    /// Write entire str to a file.
    pub fn write_file<T: AsRef<Path>>(&self, path: T, text: &str) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        fs::write(path, text).with_context(|| format!("writing file {path:?}"))?;
        Ok(())
    }

    /// Delete a file; a missing file is fine.
    pub fn delete_file<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        let path = path.as_ref();
        self.check_whitelist(path)?;
        remove_if_exists(path)
    }

    /// Read entire file into a String.
    pub fn read_to_buf<T: AsRef<Path>>(&self, path: T, strbuf: &mut String) -> Result<()> {
        use std::io::Read;
        let path = path.as_ref();
        strbuf.clear();
        strbuf.reserve(fs::metadata(path)?.len() as usize);
        let mut f = fs::File::open(path)?;
        f.read_to_string(strbuf)?;
        Ok(())
    }

    fn is_whitelisted<T: AsRef<Path>>(&self, path: T) -> bool {
        let path = path.as_ref();
        path.is_relative() || path.starts_with(&self.workdir)
    }

    fn check_whitelist(&self, path: &Path) -> Result<()> {
        if !self.is_whitelisted(path) {
            Err(Error::NotWhitelisted(path.to_str().ok_or(PathEncodingError)?.to_owned()).into())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_runtime_dirs_and_whitelist() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let mut fs = Fs::new(dir.path());
        fs.ensure_runtime_dirs(false)?;
        assert!(fs.sig_dir().is_dir());
        assert!(fs.tasks_dir().is_dir());

        let inside = fs.workdir().join("out.txt");
        fs.write_file(&inside, "x")?;
        assert!(fs.exists(&inside));
        fs.delete_file(&inside)?;
        fs.delete_file(&inside)?;

        let err = fs.write_file("/tmp/../outside.txt", "x").unwrap_err();
        assert!(format!("{err}").contains("outside the working directory"));
        Ok(())
    }

    #[test]
    fn test_missing_workdir() {
        let mut fs = Fs::new(Path::new("/definitely/not/here"));
        assert!(fs.ensure_runtime_dirs(false).is_err());
    }
}

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde_json::Value;

use super::{remove_if_exists, write_atomic, Error};

const PENDING_TASK: &str = "pending_task";

/// One `key<TAB>value` line of the journal.
#[derive(Debug, Clone, PartialEq)]
pub enum JournalEntry {
    /// A task left running on `host` when we exited.
    PendingTask { host: String, id: String },
    /// Anything else; kept for information only.
    Other(String, Value),
}

impl JournalEntry {
    fn to_line(&self) -> Result<String> {
        let (key, val) = match self {
            Self::PendingTask { host, id } => (PENDING_TASK, serde_json::json!([host, id])),
            Self::Other(key, val) => (key.as_str(), val.clone()),
        };
        Ok(format!("{key}\t{}", serde_json::to_string(&val)?))
    }

    fn from_line(lineno: usize, line: &str) -> Result<Self, Error> {
        let bad = || Error::InvalidJournal(lineno, line.to_owned());
        let (key, val) = line.split_once('\t').ok_or_else(bad)?;
        let val: Value = serde_json::from_str(val).map_err(|_| bad())?;
        if key != PENDING_TASK {
            return Ok(Self::Other(key.to_owned(), val));
        }
        match val.as_array().map(|a| a.as_slice()) {
            Some([Value::String(host), Value::String(id)]) => Ok(Self::PendingTask {
                host: host.clone(),
                id: id.clone(),
            }),
            _ => Err(bad()),
        }
    }
}

/// Status journal for one workflow, used to resume after we exit
/// with tasks still running on their hosts.
#[derive(Debug, Clone)]
pub struct Journal {
    path: PathBuf,
}

impl Journal {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Every entry in the journal; nothing if there is no journal.
    pub fn load(&self) -> Result<Vec<JournalEntry>> {
        if !self.path.exists() {
            return Ok(Vec::with_capacity(0));
        }
        let text = std::fs::read_to_string(&self.path)
            .with_context(|| format!("reading journal {:?}", self.path))?;
        let mut entries = Vec::new();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(JournalEntry::from_line(i + 1, line)?);
        }
        Ok(entries)
    }

    /// `(host, id)` of every task recorded as pending.
    pub fn pending_tasks(&self) -> Result<Vec<(String, String)>> {
        Ok(self
            .load()?
            .into_iter()
            .filter_map(|entry| match entry {
                JournalEntry::PendingTask { host, id } => Some((host, id)),
                JournalEntry::Other(..) => None,
            })
            .collect())
    }

    /// Replace the journal with one line per pending task.
    pub fn write(&self, tasks: &[(String, String)]) -> Result<()> {
        let mut text = String::with_capacity(tasks.len() * 64);
        for (host, id) in tasks {
            let entry = JournalEntry::PendingTask {
                host: host.clone(),
                id: id.clone(),
            };
            text.push_str(&entry.to_line()?);
            text.push('\n');
        }
        log::info!("writing {} pending tasks to {:?}", tasks.len(), self.path);
        write_atomic(&self.path, &text)
    }

    pub fn remove(&self) -> Result<()> {
        remove_if_exists(&self.path)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_write_and_load() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let journal = Journal::new(dir.path().join("wf.status"));
        assert!(journal.load()?.is_empty());

        let tasks = vec![
            ("local".to_owned(), "t1".to_owned()),
            ("local".to_owned(), "t2".to_owned()),
        ];
        journal.write(&tasks)?;
        let text = std::fs::read_to_string(journal.path())?;
        assert_eq!("pending_task\t[\"local\",\"t1\"]\npending_task\t[\"local\",\"t2\"]\n", text);
        assert_eq!(tasks, journal.pending_tasks()?);

        journal.remove()?;
        assert!(!journal.path().exists());
        Ok(())
    }

    #[test]
    fn test_descriptive_and_bad_lines() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("wf.status");
        std::fs::write(&path, "script\t\"run.sos\"\npending_task\t[\"h\",\"x\"]\n")?;
        let journal = Journal::new(path.clone());
        assert_eq!(
            JournalEntry::Other("script".to_owned(), Value::from("run.sos")),
            journal.load()?[0]
        );
        assert_eq!(vec![("h".to_owned(), "x".to_owned())], journal.pending_tasks()?);

        std::fs::write(&path, "pending_task\t[\"h\"]\n")?;
        assert!(journal.load().is_err());
        Ok(())
    }
}

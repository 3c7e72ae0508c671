use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Result;
use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use super::append_line;

/// Closing record of one workflow run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub workflow_id: String,
    pub master_id: String,
    pub name: String,
    pub start_time: DateTime<Local>,
    pub end_time: DateTime<Local>,
    pub command_line: String,
    /// fingerprint of the script
    pub script: String,
    /// counter name -> value
    pub stat: BTreeMap<String, u64>,
    pub dag: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Line {
    Step {
        workflow_id: String,
        step: String,
        status: String,
        time: DateTime<Local>,
    },
    Workflow(RunRecord),
}

/// Append-only run log, one json object per line.
#[derive(Debug, Clone)]
pub struct Report {
    path: PathBuf,
}

impl Report {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record a step changing status.
    pub fn step(&self, workflow_id: &str, step: &str, status: &str) -> Result<()> {
        self.write(&Line::Step {
            workflow_id: workflow_id.to_owned(),
            step: step.to_owned(),
            status: status.to_owned(),
            time: Local::now(),
        })
    }

    /// Write the closing line of a run.
    pub fn close(&self, record: RunRecord) -> Result<()> {
        self.write(&Line::Workflow(record))
    }

    /// The last closing record in the report, if any.
    pub fn last_record(&self) -> Result<Option<RunRecord>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let text = std::fs::read_to_string(&self.path)?;
        for line in text.lines().rev() {
            if let Ok(Line::Workflow(record)) = serde_json::from_str(line) {
                return Ok(Some(record));
            }
        }
        Ok(None)
    }

    fn write(&self, line: &Line) -> Result<()> {
        append_line(&self.path, &serde_json::to_string(line)?)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_close_record() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let report = Report::new(dir.path().join("report.jsonl"));
        assert_eq!(None, report.last_record()?);

        report.step("wf", "a_1", "completed")?;
        let now = Local::now();
        let record = RunRecord {
            workflow_id: "wf".to_owned(),
            master_id: "wf".to_owned(),
            name: "a".to_owned(),
            start_time: now,
            end_time: now,
            command_line: "sos run.sos".to_owned(),
            script: "abc".to_owned(),
            stat: BTreeMap::from([("step_completed".to_owned(), 1)]),
            dag: None,
        };
        report.close(record.clone())?;

        let text = std::fs::read_to_string(report.path())?;
        assert_eq!(2, text.lines().count());
        assert!(text.lines().next().is_some_and(|l| l.contains("\"event\":\"step\"")));
        assert_eq!(Some(record), report.last_record()?);
        Ok(())
    }
}

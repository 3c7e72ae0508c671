use anyhow::Result;
use colored::Colorize;

use super::Error;

/// For re-throwing after we've printed a list of errors to the user.
#[derive(Debug, thiserror::Error)]
#[error("{0} failed due to {1} errors")]
pub struct AggregatedErrors(pub String, pub usize);

/// One failed node.
#[derive(Debug, Clone)]
struct Entry {
    label: String,
    summary: String,
    detail: String,
}

/// Per-node errors collected while a workflow runs.
#[derive(Debug, Clone)]
pub struct ErrorSink {
    entries: Vec<Entry>,
}

impl Default for ErrorSink {
    fn default() -> Self {
        Self {
            // ideally we won't have any,
            // and we don't mind reallocating if we're already in an error state:
            entries: Vec::with_capacity(0),
        }
    }
}

impl ErrorSink {
    /// Record an error for the node `label`.
    /// Errors whose first line we have already seen are dropped.
    pub fn add(&mut self, label: &str, detail: &str) {
        let summary = detail.lines().next().unwrap_or_default().to_owned();
        log::trace!("{label}: {detail}");
        if self.entries.iter().any(|e| e.summary == summary) {
            log::debug!("dropping duplicate error from {label}");
            return;
        }
        self.entries.push(Entry {
            label: label.to_owned(),
            summary,
            detail: detail.to_owned(),
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One line per error, for handing to a parent workflow.
    pub fn summary(&self) -> String {
        self.entries
            .iter()
            .map(|e| format!("{}: {}", e.label, e.summary))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Print the full list of errors to stderr, and fail with an aggregated
    /// error if there were any.
    pub fn print_recap(&self, label: &str) -> Result<()> {
        if self.entries.is_empty() {
            return Ok(());
        }
        self.print(label);
        Err(AggregatedErrors(label.to_owned(), self.entries.len()).into())
    }

    /// Print the full list of errors to stderr.
    pub fn print(&self, label: &str) {
        eprintln!("\n{} {}:\n", "Encountered errors while".red(), label.red());
        for entry in &self.entries {
            eprintln!("{} in {}: {}", "ERROR".red(), entry.label, entry.summary);
            for line in entry.detail.lines().skip(1) {
                eprintln!("\t{line}");
            }
        }
        eprintln!();
    }
}

/// The classes of failure a run can end with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// one or more steps or tasks failed
    Step,
    /// the workflow can't be planned
    Plan,
    Interrupted,
    Other,
}

impl ErrorKind {
    /// Classify an error by the first recognized cause in its chain.
    pub fn of(e: &anyhow::Error) -> Self {
        for cause in e.chain() {
            if cause.is::<AggregatedErrors>() {
                return Self::Step;
            }
            if cause.is::<dag::PlanError>()
                || cause.is::<workflow::Error>()
                || cause.is::<syntax::Error>()
            {
                return Self::Plan;
            }
            match cause.downcast_ref::<Error>() {
                Some(Error::Interrupted) => return Self::Interrupted,
                Some(Error::InterruptedAfterFailure(_)) => return Self::Plan,
                _ => (),
            }
        }
        Self::Other
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Step => 1,
            Self::Plan => 2,
            Self::Interrupted => 130,
            Self::Other => 3,
        }
    }
}

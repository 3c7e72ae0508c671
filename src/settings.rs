use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use workflow::Target;

use crate::args::Args;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("Workflow script \"{0}\" not found")]
    ScriptNotFound(String),
    #[error("max_procs must be at least 1")]
    NoProcs,
    #[error("Working directory \"{0}\" not found")]
    WorkdirNotFound(String),
}

/// How step signatures are used.
#[derive(clap::ValueEnum, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SigMode {
    /// skip steps whose signature matches
    #[default]
    Default,
    /// remove outputs and rerun everything
    Force,
    /// never read or write signatures
    Ignore,
    /// record signatures for existing outputs without running
    Build,
    /// fail if a signature does not match
    Assert,
}

impl fmt::Display for SigMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Default => "default",
            Self::Force => "force",
            Self::Ignore => "ignore",
            Self::Build => "build",
            Self::Assert => "assert",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    #[default]
    Run,
    Dryrun,
}

/// Keys the executor reads.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub max_procs: usize,
    pub sig_mode: SigMode,
    pub run_mode: RunMode,
    /// `None` lets each task host decide
    pub wait_for_task: Option<bool>,
    pub resume_mode: bool,
    /// not interpreted here; handed to evaluators
    pub config_file: Option<PathBuf>,
    pub output_dag: Option<PathBuf>,
    pub output_report: Option<PathBuf>,
    pub verbosity: u8,
    pub master_id: Option<String>,
    pub download_timeout: Duration,
    pub workdir: PathBuf,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            max_procs: 4,
            sig_mode: SigMode::Default,
            run_mode: RunMode::Run,
            wait_for_task: None,
            resume_mode: false,
            config_file: None,
            output_dag: None,
            output_report: None,
            verbosity: 2,
            master_id: None,
            download_timeout: Duration::from_secs(60),
            workdir: PathBuf::from("."),
        }
    }
}

impl RunConfig {
    pub fn dryrun(&self) -> bool {
        self.run_mode == RunMode::Dryrun
    }
}

/// Settings are like Args, except all the logic has
/// been applied so e.g. defaults are added in.
#[derive(Debug, Clone)]
pub struct Settings {
    pub script: PathBuf,
    pub workflow: Option<String>,
    pub targets: Vec<Target>,
    pub config: RunConfig,
    /// how we were invoked, for the report
    pub command_line: String,
}

/// `@name` is a step, `$name` a variable, anything else a file.
pub fn parse_target(text: &str) -> Target {
    if let Some(name) = text.strip_prefix('@') {
        Target::step(name)
    } else if let Some(name) = text.strip_prefix('$') {
        Target::var(name)
    } else {
        Target::file(text)
    }
}

impl TryFrom<Args> for Settings {
    type Error = anyhow::Error;
    fn try_from(args: Args) -> Result<Self, Self::Error> {
        let script = PathBuf::from(&args.script);
        if !script.is_file() {
            return Err(Error::ScriptNotFound(args.script).into());
        }
        if args.max_procs == 0 {
            return Err(Error::NoProcs.into());
        }
        let workdir = PathBuf::from(&args.workdir);
        if !workdir.is_dir() {
            return Err(Error::WorkdirNotFound(args.workdir).into());
        }

        let config = RunConfig {
            max_procs: args.max_procs,
            sig_mode: args.sig_mode,
            run_mode: if args.dryrun { RunMode::Dryrun } else { RunMode::Run },
            wait_for_task: args.wait_for_task,
            resume_mode: args.resume,
            config_file: args.config.map(PathBuf::from),
            output_dag: args.dag.map(PathBuf::from),
            output_report: args.report.map(PathBuf::from),
            verbosity: args.verbosity,
            master_id: args.master_id,
            download_timeout: Duration::from_secs(args.download_timeout),
            workdir,
        };

        Ok(Self {
            script: script.canonicalize()?,
            workflow: args.workflow,
            targets: args.targets.iter().map(|t| parse_target(t)).collect(),
            config,
            command_line: std::env::args().collect::<Vec<_>>().join(" "),
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use clap::Parser;

    #[test]
    fn test_parse_target() {
        assert_eq!(Target::step("align"), parse_target("@align"));
        assert_eq!(Target::var("n"), parse_target("$n"));
        assert_eq!(Target::file("a/b.txt"), parse_target("./a/b.txt"));
    }

    #[test]
    fn test_settings_from_args() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let script = dir.path().join("run.sos");
        std::fs::write(&script, "step a_1 {\n}\n")?;
        let script = script.to_string_lossy().into_owned();
        let workdir = dir.path().to_string_lossy().into_owned();

        let args = Args::parse_from(["sos", &script, "-d", &workdir, "-n", "-j", "2"]);
        let settings = Settings::try_from(args)?;
        assert!(settings.config.dryrun());
        assert_eq!(2, settings.config.max_procs);
        assert_eq!(None, settings.config.wait_for_task);

        let args = Args::parse_from(["sos", &script, "-d", &workdir, "-j", "0"]);
        assert!(Settings::try_from(args).is_err());
        let args = Args::parse_from(["sos", "missing.sos", "-d", &workdir]);
        assert!(Settings::try_from(args).is_err());
        Ok(())
    }
}

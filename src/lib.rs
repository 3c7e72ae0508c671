/// High-level command line app
mod app;
/// Definition of command-line args
mod args;
/// Workflow execution
mod exec;
/// Filesystem operations
mod fs;
/// Command-line run settings
mod settings;
/// Text UI
mod ui;

// exported for tests:
pub use app::App;
pub use args::Args;
pub use exec::{
    ErrorKind, Hosts, LocalHost, Outcome, StepContext, StepError, StepEvaluator, StepOutput,
    TaskHost, TaskResult, TaskSpec, TaskStatus, WorkerCtx,
};
pub use fs::{Journal, JournalEntry, Report, RunRecord};
pub use settings::{parse_target, RunConfig, RunMode, SigMode, Settings};

/// Run the command-line app.
pub fn run() -> Result<Outcome, anyhow::Error> {
    use clap::Parser;
    let args = Args::parse();

    // INTERPRET SETTINGS ///////////////
    let settings: Settings = args.try_into()?;

    let log_level = match settings.config.verbosity {
        0 => log::LevelFilter::Error,
        1 => log::LevelFilter::Warn,
        2 => log::LevelFilter::Info,
        3 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    simple_logging::log_to_stderr(log_level);
    exec::install_interrupt_handler();

    // RUN THE THING /////////////////
    App::new(settings).run()
}

/// Process exit code for a failed run.
pub fn exit_code(e: &anyhow::Error) -> i32 {
    ErrorKind::of(e).exit_code()
}

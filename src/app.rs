use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Local;
use colored::Colorize;

use syntax::{self, ast};
use workflow::{Target, Workflow};

use crate::exec::{
    Hosts, LocalHost, Orchestrator, Outcome, ProcessGroups, RunEnv, Scheduler, ShellEvaluator,
    SignatureStore, StepEvaluator, TaskHost, WorkerEnv,
};
use crate::fs::{Fs, Journal, Report, RunRecord};
use crate::settings::Settings;
use crate::ui::Ui;

/// This struct actually runs the command-line app.
pub struct App {
    /// Interpreted command line settings
    settings: Settings,
    /// Filesystem interface
    fs: Fs,
    /// User interface
    ui: Ui,
    /// Runs step bodies
    evaluator: Arc<dyn StepEvaluator>,
    /// Where offloaded tasks can go
    hosts: Hosts,
    groups: ProcessGroups,
}

impl App {
    /// Create a new `App`, running steps with bash.
    pub fn new(settings: Settings) -> Self {
        let fs = Fs::new(&settings.config.workdir);
        let ui = Ui::new(settings.config.verbosity);
        Self {
            settings,
            fs,
            ui,
            evaluator: Arc::new(ShellEvaluator),
            hosts: Hosts::default(),
            groups: ProcessGroups::default(),
        }
    }

    /// Run steps with `evaluator` instead.
    pub fn with_evaluator(mut self, evaluator: Arc<dyn StepEvaluator>) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// Make `host` available to steps; replaces any host with the same name.
    pub fn with_host(mut self, host: Arc<dyn TaskHost>) -> Self {
        self.hosts.add(host);
        self
    }

    /// Run the app: parse the script, plan the workflow, and execute it.
    pub fn run(mut self) -> Result<Outcome> {
        let start_time = Local::now();
        self.ui.verbose_msg(&format!(
            "Using working directory {:?}",
            self.settings.config.workdir
        ));
        self.fs.ensure_runtime_dirs(self.ui.verbose())?;
        if self.hosts.get(LocalHost::NAME).is_err() {
            self.hosts
                .add(Arc::new(LocalHost::new(self.fs.tasks_dir())));
        }

        let mut text = String::with_capacity(0); // will be resized later.
        self.read_script(&mut text)?;
        let items = self.parse_script(&text)?;
        let wf = Arc::new(Workflow::load(items, &text)?);
        let name = match &self.settings.workflow {
            Some(name) => name.clone(),
            None => wf.default_name().to_owned(),
        };

        let fingerprint = fingerprint(wf.digest(), &name, &self.settings.targets);
        log::debug!("workflow {name} has fingerprint {fingerprint}");
        let config = &self.settings.config;
        let journal = Journal::new(self.fs.journal(&fingerprint));
        let report = Report::new(match &config.output_report {
            Some(path) => path.clone(),
            None => self.fs.default_report(),
        });
        let signatures = SignatureStore::new(self.fs.sig_dir());

        self.ui.verbose_progress("Planning workflow");
        self.ui.start_timer();
        let env = RunEnv::new(self.fs.workdir(), signatures.clone()).with_vars(wf.globals().clone());
        let mut sched = Scheduler::new(wf.clone(), &name, fingerprint.clone(), env, false, self.ui.clone())
            .with_dag_file(config.output_dag.clone())
            .with_report(report.clone());
        sched
            .plan(&self.settings.targets)
            .with_context(|| format!("while planning workflow \"{name}\""))?;
        self.ui.done();
        self.ui.print_elapsed("Planning workflow");

        let env = WorkerEnv {
            wf: wf.clone(),
            config: config.clone(),
            fs: self.fs.clone(),
            signatures,
            evaluator: self.evaluator.clone(),
            hosts: self.hosts.clone(),
            groups: self.groups.clone(),
        };
        let mut orchestrator = Orchestrator::new(sched, env, journal.clone(), self.ui.clone());
        let outcome = orchestrator
            .run()
            .with_context(|| format!("while running workflow \"{name}\""))?;
        let mut sched = orchestrator.into_scheduler();

        if let Outcome::Suspended { .. } = outcome {
            return Ok(outcome);
        }

        if config.dryrun() {
            log::info!("removing {} placeholder outputs", sched.placeholders.len());
            for path in &sched.placeholders {
                self.fs.delete_file(path)?;
            }
        }
        journal.remove()?;
        for label in sched.unreachable() {
            self.ui.pending(&label, "not run");
        }
        sched.check_stalled();
        sched.errors.print_recap(&format!("running workflow \"{name}\""))?;

        let counters = sched.counters;
        report.close(RunRecord {
            workflow_id: fingerprint.clone(),
            master_id: config.master_id.clone().unwrap_or(fingerprint),
            name,
            start_time,
            end_time: Local::now(),
            command_line: self.settings.command_line.clone(),
            script: wf.digest().to_owned(),
            stat: counters.to_map(),
            dag: config.output_dag.clone(),
        })?;

        self.ui.summary(&format!(
            "{} steps completed, {} skipped; {} substeps; {} tasks",
            counters.step_completed,
            counters.step_skipped,
            counters.substep_completed + counters.substep_skipped,
            counters.task_completed,
        ));
        if self.ui.verbose() {
            eprintln!("{}", "Workflow complete.".green());
        }
        Ok(outcome)
    }

    fn read_script(&mut self, text: &mut String) -> Result<()> {
        self.ui.verbose_progress("Reading workflow script");
        self.fs
            .read_to_buf(&self.settings.script, text)
            .with_context(|| format!("while reading script {:?}", self.settings.script))?;
        self.ui.done();
        Ok(())
    }

    fn parse_script<'a>(&mut self, text: &'a str) -> Result<Vec<ast::Item<'a>>> {
        self.ui.verbose_progress("Parsing workflow script");
        self.ui.start_timer();
        let items = syntax::parse(text)
            .with_context(|| format!("while parsing script {:?}", self.settings.script))?;
        self.ui.done();
        self.ui.print_elapsed("Parsing workflow script");
        Ok(items)
    }
}

/// Identifies one workflow run of one script, for its journal.
fn fingerprint(digest: &str, name: &str, targets: &[Target]) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(digest.as_bytes());
    hasher.update(b":");
    hasher.update(name.as_bytes());
    for target in targets {
        hasher.update(b":");
        hasher.update(target.to_string().as_bytes());
    }
    hasher.finalize().to_hex().as_str()[..16].to_owned()
}

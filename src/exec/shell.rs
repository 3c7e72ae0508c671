use std::path::Path;
use std::process::Command;

use anyhow::{Context, Result};
use workflow::{parse_value, render_value, shell_quote, ExistKind, Namespace, StepDescriptor, Target};

use super::evaluator::{StepContext, StepError, StepEvaluator, StepOutput};
use super::run_cmd::run_cmd;
use super::tasks::TaskSpec;
use super::worker::WorkerCtx;
use super::Error;

/// Runs step bodies with `bash`.
#[derive(Debug, Default, Clone, Copy)]
pub struct ShellEvaluator;

impl StepEvaluator for ShellEvaluator {
    fn evaluate(&self, cx: &StepContext, ctx: &mut WorkerCtx) -> Result<StepOutput, StepError> {
        cx.check_inputs()?;
        let mut output = StepOutput::default();

        let mut vars = cx.job.vars.clone();
        for name in &cx.step.options.workflows {
            let result = ctx.run_workflow(name, Vec::with_capacity(0), vars.clone())?;
            output.counters += result.counters;
            if let Some(e) = result.error {
                return Err(StepError::Failed(format!(
                    "nested workflow \"{name}\" failed:\n{e}"
                )));
            }
            vars.extend(result.shared.clone());
            output.shared.extend(result.shared);
        }

        let stem = &cx.job.stem;
        let shared_file = cx.fs.step_file(stem, "shared");
        let output_file = cx.fs.step_file(stem, "output");
        cx.fs.delete_file(&shared_file)?;
        cx.fs.delete_file(&output_file)?;

        let mut script = ScriptBuilder::new();
        script.write_exports(cx.step.global_def.as_str());
        for (name, val) in vars.iter().filter(|(name, _)| is_ident(name)) {
            script.write_export(name, &render_value(val));
        }

        match &cx.step.options.task {
            Some(host) => {
                // the task may run far from here; it only gets its output list through the script.
                script.write_export("SOS_OUTPUT", &output_file.to_string_lossy());
                script.write_export("SOS_STEP", &cx.step.name);
                script.write_code(&cx.step.body);
                let task = TaskSpec::new(
                    cx.step,
                    stem,
                    script.finish(),
                    cx.fs.workdir().to_path_buf(),
                );
                let results = ctx.submit_tasks(host, std::slice::from_ref(&task))?;
                for result in results {
                    cx.fs.write_file(cx.fs.step_file(stem, "out"), &result.stdout)?;
                    output.shared.extend(result.shared);
                }
            }
            None => {
                script.write_code(&cx.step.body);
                let script_file = cx.fs.step_file(stem, "sh");
                cx.fs.write_file(&script_file, &script.finish())?;

                let mut cmd = Command::new("bash");
                cmd.arg(&script_file)
                    .current_dir(cx.fs.workdir())
                    .env("SOS_SHARED", &shared_file)
                    .env("SOS_OUTPUT", &output_file)
                    .env("SOS_STEP", &cx.step.name);
                let err_file = cx.fs.step_file(stem, "err");
                let status = run_cmd(
                    &mut cmd,
                    &cx.fs.step_file(stem, "out"),
                    &err_file,
                    cx.config.verbosity > 3,
                    cx.groups,
                )?;
                if !status.success() {
                    let e = Error::SubprocessFailed(
                        cx.step.name.clone(),
                        status.to_string(),
                        err_file.display().to_string(),
                    );
                    return Err(StepError::Failed(e.to_string()));
                }
                output.shared.extend(read_shared(&shared_file)?);
            }
        }

        if cx.job.outputs.is_undetermined() {
            output.outputs = Some(read_outputs(&output_file)?);
        }
        let produced = output
            .outputs
            .as_deref()
            .unwrap_or_else(|| cx.job.outputs.targets());
        check_outputs(cx.step, produced, cx)?;

        Ok(output)
    }
}

fn check_outputs(step: &StepDescriptor, outputs: &[Target], cx: &StepContext) -> Result<()> {
    for target in outputs.iter().filter(|t| t.is_file()) {
        if !target.exists(ExistKind::Target, cx.env)? {
            return Err(Error::ExpectedOutputMissing(target.to_string(), step.name.clone()).into());
        }
    }
    Ok(())
}

/// `name=value` lines a step wrote to `$SOS_SHARED`.
pub fn read_shared(path: &Path) -> Result<Namespace> {
    let mut shared = Namespace::new();
    if !path.exists() {
        return Ok(shared);
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
    for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match line.split_once('=') {
            Some((name, val)) if is_ident(name.trim()) => {
                shared.insert(name.trim().to_owned(), parse_value(val));
            }
            _ => log::warn!("ignoring malformed shared line \"{line}\" in {path:?}"),
        }
    }
    Ok(shared)
}

/// Paths a step wrote to `$SOS_OUTPUT`, one per line.
fn read_outputs(path: &Path) -> Result<Vec<Target>> {
    if !path.exists() {
        return Ok(Vec::with_capacity(0));
    }
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path:?}"))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(Target::file)
        .collect())
}

fn is_ident(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c == '_' || c.is_ascii_alphabetic())
        && chars.all(|c| c == '_' || c.is_ascii_alphanumeric())
}

/// Builds the text of a step script.
#[derive(Debug)]
struct ScriptBuilder {
    text: String,
}

impl ScriptBuilder {
    /// shebang line and bash options
    fn new() -> Self {
        let mut text = String::with_capacity(512);
        text.push_str("#!/usr/bin/env bash\nset -eo pipefail\n\n");
        Self { text }
    }

    /// lines that are already `export` statements
    fn write_exports(&mut self, exports: &str) {
        self.text.push_str(exports);
        if !exports.is_empty() && !exports.ends_with('\n') {
            self.text.push('\n');
        }
    }

    fn write_export(&mut self, name: &str, val: &str) {
        self.text.push_str("export ");
        self.text.push_str(name);
        self.text.push('=');
        self.text.push_str(&shell_quote(val));
        self.text.push('\n');
    }

    fn write_code(&mut self, code: &str) {
        self.text.push('\n');
        self.text.push_str(code);
        if !code.ends_with('\n') {
            self.text.push('\n');
        }
    }

    fn finish(self) -> String {
        self.text
    }
}

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use serde_json::Value;
use syntax::ast;
use util::{HashMap, IdVec};
use uuid::Uuid;

use crate::{
    expand, render_value, shell_quote, Bindings, DeclaredTargets, Error, Namespace, Pattern,
    StepDescriptor, StepOptions, TargetTemplate,
};

util::id!(
    /// Index of a step in its [`Workflow`].
    StepId,
    u16
);

/// Workflow run when no step has an index.
pub const DEFAULT_WORKFLOW: &str = "default";

// all step uuids live under this namespace:
const STEP_NAMESPACE: Uuid = Uuid::from_u128(0x5e0c_1a2b_7f3d_4e6a_9b8c_0d1e_2f3a_4b5c);

/// All the steps defined in a script, plus its global variables.
#[derive(Debug)]
pub struct Workflow {
    steps: IdVec<StepId, StepDescriptor>,
    by_name: HashMap<String, StepId>,
    globals: Namespace,
    global_def: String,
    /// blake3 digest of the script text
    digest: String,
}

impl Workflow {
    /// Build a workflow from the parsed items of the script `text`.
    pub fn load(items: Vec<ast::Item>, text: &str) -> Result<Self> {
        let digest = blake3::hash(text.as_bytes()).to_hex().to_string();
        let mut wf = Self {
            steps: IdVec::with_capacity(items.len()),
            by_name: HashMap::default(),
            globals: Namespace::new(),
            global_def: String::new(),
            digest,
        };
        // globals first, wherever they appear, so every step sees all of them:
        let (globals, steps): (Vec<_>, Vec<_>) = items
            .into_iter()
            .partition(|item| matches!(item, ast::Item::GlobalConfig(_)));
        for item in globals {
            if let ast::Item::GlobalConfig(assts) = item {
                wf.add_globals(assts)?;
            }
        }
        for item in steps {
            if let ast::Item::Step(block) = item {
                let name = block.name.to_owned();
                wf.add_step(block).with_context(|| format!("while loading step \"{name}\""))?;
            }
        }
        Ok(wf)
    }

    /// Fingerprint of the script this workflow was loaded from.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Values defined in `global` blocks.
    pub fn globals(&self) -> &Namespace {
        &self.globals
    }

    /// Shell preamble defining the globals.
    pub fn global_def(&self) -> &str {
        &self.global_def
    }

    pub fn get_step(&self, id: StepId) -> &StepDescriptor {
        self.steps.get(id)
    }

    pub fn find_step(&self, name: &str) -> Option<StepId> {
        self.by_name.get(name).copied()
    }

    pub fn steps(&self) -> impl Iterator<Item = (StepId, &StepDescriptor)> {
        self.steps.iter_with_ids()
    }

    /// Name of the workflow to run if none is given:
    /// the workflow of the first indexed step.
    pub fn default_name(&self) -> &str {
        self.steps
            .iter()
            .find(|step| step.index.is_some())
            .map(|step| step.workflow.as_str())
            .unwrap_or(DEFAULT_WORKFLOW)
    }

    /// The indexed steps of workflow `name`, in index order.
    pub fn forward_steps(&self, name: &str) -> Result<Vec<StepId>> {
        let mut steps: Vec<_> = self
            .steps()
            .filter(|(_, step)| step.index.is_some() && step.workflow == name)
            .map(|(id, step)| (step.index, id))
            .collect();
        if steps.is_empty() {
            return Err(Error::EmptyWorkflow(name.to_owned()).into());
        }
        steps.sort();
        Ok(steps.into_iter().map(|(_, id)| id).collect())
    }

    /// Every step not in the forward workflow `name`.
    pub fn auxiliary_steps(&self, name: &str) -> Vec<StepId> {
        self.steps()
            .filter(|(_, step)| step.index.is_none() || step.workflow != name)
            .map(|(id, _)| id)
            .collect()
    }
}

// building the workflow /////////////
impl Workflow {
    fn add_globals(&mut self, assts: Vec<(&str, ast::Rhs)>) -> Result<()> {
        for (k, v) in assts {
            let val = self.eval_rhs(&v).ok_or_else(|| Error::UnboundGlobal(k.to_owned()))??;
            self.global_def.push_str(&format!(
                "export {}={}\n",
                k,
                shell_quote(&render_value(&val))
            ));
            self.globals.insert(k.to_owned(), val);
        }
        Ok(())
    }

    // None for an unbound rhs.
    fn eval_rhs(&self, rhs: &ast::Rhs) -> Option<Result<Value, Error>> {
        let val = match rhs {
            ast::Rhs::Unbound => return None,
            ast::Rhs::Literal { val } => Ok(Value::String(val.to_string())),
            ast::Rhs::Variable { name } => self
                .globals
                .get(*name)
                .cloned()
                .ok_or_else(|| Error::UndefinedVariable(name.to_string())),
            ast::Rhs::Interp { text, .. } => {
                expand(text, &self.globals, &Bindings::new()).map(Value::String)
            }
        };
        Some(val)
    }

    fn option_text(&self, step: &str, key: &str, rhs: &ast::Rhs) -> Result<String, Error> {
        match self.eval_rhs(rhs) {
            Some(val) => Ok(render_value(&val?)),
            None => Err(Error::BadOption(step.to_owned(), key.to_owned(), "needs a value")),
        }
    }

    fn add_step(&mut self, block: ast::StepBlock) -> Result<()> {
        let name = block.name;
        if self.by_name.contains_key(name) {
            return Err(Error::DuplicateStep(name.to_owned()).into());
        }
        let (workflow, index) = StepDescriptor::split_name(name);

        let mut options = StepOptions::default();
        let mut inputs: Option<DeclaredTargets> = None;
        let mut outputs = DeclaredTargets::default();
        let mut depends = DeclaredTargets::default();
        // what went into the header, for the digest:
        let mut header = Vec::with_capacity(block.specs.len());

        for spec in &block.specs {
            header.push(format!("{spec:?}"));
            match spec {
                ast::BlockSpec::Input(targets) => {
                    add_targets(inputs.get_or_insert_with(Default::default), targets)
                }
                ast::BlockSpec::Output(targets) => add_targets(&mut outputs, targets),
                ast::BlockSpec::Depends(targets) => add_targets(&mut depends, targets),
                ast::BlockSpec::Option { key, rhs } => {
                    self.add_option(&mut options, name, key, rhs)?
                }
            }
        }

        let body = block.code.text.to_owned();
        let header = header.join("\n");
        let mut hasher = blake3::Hasher::new();
        for part in [name, self.global_def.as_str(), header.as_str(), body.as_str()] {
            hasher.update(part.as_bytes());
            hasher.update(&[0]);
        }
        let digest = hasher.finalize().to_hex().to_string();
        let uuid = Uuid::new_v5(&STEP_NAMESPACE, format!("{}:{}", self.digest, name).as_bytes());

        let step = StepDescriptor {
            uuid,
            name: name.to_owned(),
            index,
            workflow: workflow.to_owned(),
            options,
            global_def: self.global_def.clone(),
            body,
            digest,
            inputs,
            outputs,
            depends,
            code_vars: block.code.vars.iter().map(|v| v.to_string()).collect::<BTreeSet<_>>(),
        };
        let id = self.steps.push(step);
        self.by_name.insert(name.to_owned(), id);
        Ok(())
    }

    fn add_option(
        &self,
        options: &mut StepOptions,
        step: &str,
        key: &str,
        rhs: &ast::Rhs,
    ) -> Result<(), Error> {
        match key {
            "provides" => {
                let text = self.option_text(step, key, rhs)?;
                options.provides.push(Pattern::new(&text)?);
            }
            "autoprovides" => options.autoprovides = self.flag(step, key, rhs)?,
            "shared" => options.shared.push(self.option_text(step, key, rhs)?),
            "skip" => options.skip = Some(self.flag(step, key, rhs)?),
            "task" => options.task = Some(self.option_text(step, key, rhs)?),
            "workflow" => options.workflows.push(self.option_text(step, key, rhs)?),
            _ => return Err(Error::UnknownOption(step.to_owned(), key.to_owned())),
        }
        Ok(())
    }

    // a bare flag is true; otherwise the value must be a boolean.
    fn flag(&self, step: &str, key: &str, rhs: &ast::Rhs) -> Result<bool, Error> {
        if let ast::Rhs::Unbound = rhs {
            return Ok(true);
        }
        match self.option_text(step, key, rhs)?.as_str() {
            "true" | "True" | "1" => Ok(true),
            "false" | "False" | "0" => Ok(false),
            _ => Err(Error::BadOption(step.to_owned(), key.to_owned(), "must be true or false")),
        }
    }
}

fn add_targets(declared: &mut DeclaredTargets, targets: &[ast::TargetRef]) {
    for target in targets {
        match target {
            ast::TargetRef::File { text, .. } => {
                declared.targets.push(TargetTemplate::File(text.to_string()))
            }
            ast::TargetRef::Step(name) => declared.targets.push(TargetTemplate::Step(name.to_string())),
            ast::TargetRef::Var(name) => declared.targets.push(TargetTemplate::Var(name.to_string())),
            ast::TargetRef::Undetermined => declared.undetermined = true,
        }
    }
}

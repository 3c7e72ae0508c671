use std::collections::BTreeSet;

use uuid::Uuid;

use crate::{expand, Bindings, Error, Namespace, Pattern, Target, TargetSet};

/// A target as written in a step header, before variables are substituted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetTemplate {
    /// file path text, possibly with `$var` and `{name}` references
    File(String),
    Step(String),
    Var(String),
}

impl TargetTemplate {
    /// Substitute variables, producing a concrete target.
    pub fn instantiate(&self, ns: &Namespace, bindings: &Bindings) -> Result<Target, Error> {
        Ok(match self {
            Self::File(text) => Target::file(expand(text, ns, bindings)?),
            Self::Step(name) => Target::step(name.as_str()),
            Self::Var(name) => Target::var(name.as_str()),
        })
    }
}

/// One kind of header statement (`<`, `>` or `^`), merged across repeats.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeclaredTargets {
    pub targets: Vec<TargetTemplate>,
    /// a `?` appeared in the list
    pub undetermined: bool,
}

impl DeclaredTargets {
    pub fn instantiate(&self, ns: &Namespace, bindings: &Bindings) -> Result<TargetSet, Error> {
        if self.undetermined {
            return Ok(TargetSet::Undetermined);
        }
        self.targets
            .iter()
            .map(|t| t.instantiate(ns, bindings))
            .collect()
    }
}

/// Options given after `::` in a step header.
#[derive(Debug, Clone, Default)]
pub struct StepOptions {
    /// Targets (or target patterns) this step can produce on demand.
    pub provides: Vec<Pattern>,
    /// The step can produce any of its declared file outputs on demand.
    pub autoprovides: bool,
    /// Variables the step exports to the shared namespace when it completes.
    pub shared: Vec<String>,
    pub skip: Option<bool>,
    /// Run the body as a task on the named host.
    pub task: Option<String>,
    /// Nested workflows to run before the body.
    pub workflows: Vec<String>,
}

/// An immutable description of a step, as loaded from a script.
#[derive(Debug, Clone)]
pub struct StepDescriptor {
    pub uuid: Uuid,
    pub name: String,
    /// Position within its workflow, if the name ends in `_N`.
    pub index: Option<u32>,
    /// Workflow (family) name: the step name minus any `_N` suffix.
    pub workflow: String,
    pub options: StepOptions,
    /// Preamble run before the body.
    pub global_def: String,
    pub body: String,
    /// blake3 digest of everything that affects what the step does.
    pub digest: String,
    /// `None` if the step has no `<` statement (and so takes the default input).
    pub inputs: Option<DeclaredTargets>,
    pub outputs: DeclaredTargets,
    pub depends: DeclaredTargets,
    /// Variables referenced in the body.
    pub code_vars: BTreeSet<String>,
}

impl StepDescriptor {
    /// Split a step name like `align_10` into workflow name and index.
    pub fn split_name(name: &str) -> (&str, Option<u32>) {
        if let Some((prefix, suffix)) = name.rsplit_once('_') {
            if !prefix.is_empty() && !suffix.is_empty() && suffix.bytes().all(|b| b.is_ascii_digit()) {
                if let Ok(index) = suffix.parse() {
                    return (prefix, Some(index));
                }
            }
        }
        (name, None)
    }

    /// Can this step produce `target` on demand? Returns the names the match binds.
    pub fn provides(&self, target: &Target, ns: &Namespace) -> Option<Bindings> {
        match target {
            Target::File(_) => {
                for pattern in &self.options.provides {
                    if let Some(bindings) = pattern.matches_target(target) {
                        return Some(bindings);
                    }
                }
                if self.options.autoprovides {
                    for output in &self.outputs.targets {
                        let TargetTemplate::File(text) = output else {
                            continue;
                        };
                        // outputs may themselves be patterns over {names}:
                        let Ok(text) = expand(text, ns, &Bindings::new()) else {
                            continue;
                        };
                        match Pattern::new(&text) {
                            Ok(pattern) => {
                                if let Some(bindings) = pattern.matches_target(target) {
                                    return Some(bindings);
                                }
                            }
                            Err(e) => log::debug!("ignoring output of {}: {e}", self.name),
                        }
                    }
                }
                None
            }
            Target::Var(name) => self
                .options
                .shared
                .iter()
                .any(|shared| shared == name)
                .then(Bindings::new),
            _ => None,
        }
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    /// A descriptor with just the bits a test cares about.
    pub fn descriptor(name: &str) -> StepDescriptor {
        let (workflow, index) = StepDescriptor::split_name(name);
        StepDescriptor {
            uuid: Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes()),
            name: name.to_owned(),
            index,
            workflow: workflow.to_owned(),
            options: StepOptions::default(),
            global_def: String::new(),
            body: String::new(),
            digest: String::new(),
            inputs: None,
            outputs: DeclaredTargets::default(),
            depends: DeclaredTargets::default(),
            code_vars: BTreeSet::new(),
        }
    }

    #[test]
    fn test_split_name() {
        assert_eq!(("align", Some(10)), StepDescriptor::split_name("align_10"));
        assert_eq!(("make_csv", None), StepDescriptor::split_name("make_csv"));
        assert_eq!(("step", None), StepDescriptor::split_name("step"));
        assert_eq!(("_1", None), StepDescriptor::split_name("_1"));
    }

    #[test]
    fn test_provides() {
        let mut step = descriptor("make_csv");
        step.options.provides.push(Pattern::new("data/{year}.csv").unwrap());
        step.options.shared.push("count".to_owned());
        let ns = Namespace::new();

        let bindings = step.provides(&Target::file("data/2020.csv"), &ns).unwrap();
        assert_eq!(Some(&"2020".to_owned()), bindings.get("year"));
        assert!(step.provides(&Target::file("data/2020.tsv"), &ns).is_none());
        assert!(step.provides(&Target::var("count"), &ns).is_some());
        assert!(step.provides(&Target::step("make_csv"), &ns).is_none());
    }

    #[test]
    fn test_autoprovides() {
        let mut step = descriptor("index_ref");
        step.options.autoprovides = true;
        step.outputs
            .targets
            .push(TargetTemplate::File("ref/$genome.fa.fai".to_owned()));
        let mut ns = Namespace::new();
        ns.insert("genome".to_owned(), "hg38".into());

        assert!(step.provides(&Target::file("ref/hg38.fa.fai"), &ns).is_some());
        assert!(step.provides(&Target::file("ref/hg19.fa.fai"), &ns).is_none());
        step.options.autoprovides = false;
        assert!(step.provides(&Target::file("ref/hg38.fa.fai"), &ns).is_none());
    }
}

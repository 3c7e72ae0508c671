use std::collections::BTreeSet;
use std::sync::OnceLock;

use anyhow::{Context, Result};
use regex::Regex;

use crate::{Bindings, Namespace, StepDescriptor, Target, TargetSet};

/// Result of statically analyzing one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepAnalysis {
    pub step_name: String,
    pub step_input: TargetSet,
    pub step_depends: TargetSet,
    pub step_output: TargetSet,
    /// free variables the body reads
    pub environ_vars: BTreeSet<String>,
    /// the subset of `environ_vars` bound when the step is planned
    pub signature_vars: BTreeSet<String>,
    /// variables the step writes for later steps
    pub changed_vars: BTreeSet<String>,
}

// names the shell or the runner provide, never taken from the namespace.
const BUILTINS: &[&str] = &[
    "HOME", "PATH", "PWD", "OLDPWD", "USER", "SHELL", "TMPDIR", "HOSTNAME", "IFS", "UID",
    "RANDOM", "LINENO", "SECONDS", "REPLY", "OPTARG", "OPTIND",
];

fn is_builtin(name: &str) -> bool {
    BUILTINS.contains(&name) || name.starts_with("SOS_") || name.starts_with("BASH")
}

const ASSIGNMENT: &str = r"(?m)(?:^|[;&|(]|\b(?:export|local|declare|readonly|let|do|then|else)(?:\s+-\w+)*)\s*([A-Za-z_]\w*)\+?=|\bfor\s+([A-Za-z_]\w*)\s+in\b|\bread\s+(?:-\w+\s+)*([A-Za-z_]\w*)";

fn assignment_re() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(ASSIGNMENT).ok()).as_ref()
}

/// Variables a body assigns before (or instead of) reading them.
fn local_vars(body: &str) -> BTreeSet<String> {
    let Some(re) = assignment_re() else {
        return BTreeSet::new();
    };
    re.captures_iter(body)
        .filter_map(|caps| caps.iter().skip(1).flatten().next())
        .map(|m| m.as_str().to_owned())
        .collect()
}

/// Analyze `step` for planning.
///
/// `default_input` is the output of the previous forward step, and `prev_step`
/// its name; a forward step without its own `<` statement consumes the former,
/// or depends on the latter if there is nothing concrete to consume.
/// `bindings` are names bound by matching a provide pattern.
pub fn analyze(
    step: &StepDescriptor,
    default_input: Option<&TargetSet>,
    prev_step: Option<&str>,
    ns: &Namespace,
    bindings: &Bindings,
) -> Result<StepAnalysis> {
    let ctx = || format!("while analyzing step \"{}\"", step.name);

    let mut step_depends = step.depends.instantiate(ns, bindings).with_context(ctx)?;
    let step_input = match (&step.inputs, default_input) {
        (Some(declared), _) => declared.instantiate(ns, bindings).with_context(ctx)?,
        (None, Some(default)) if !default.is_empty() => default.clone(),
        (None, _) => {
            if let Some(prev) = prev_step {
                step_depends.push(Target::step(prev));
            }
            TargetSet::default()
        }
    };
    let step_output = step.outputs.instantiate(ns, bindings).with_context(ctx)?;

    let locals = local_vars(&step.body);
    let environ_vars: BTreeSet<String> = step
        .code_vars
        .iter()
        .filter(|v| !is_builtin(v) && !locals.contains(*v))
        .cloned()
        .collect();
    let signature_vars = environ_vars
        .iter()
        .filter(|v| ns.contains_key(*v) || bindings.contains_key(*v))
        .cloned()
        .collect();
    let changed_vars = step.options.shared.iter().cloned().collect();

    log::trace!(
        "analyzed {}: input {:?}, output {:?}, environ {:?}",
        step.name,
        step_input,
        step_output,
        environ_vars
    );

    Ok(StepAnalysis {
        step_name: step.name.clone(),
        step_input,
        step_depends,
        step_output,
        environ_vars,
        signature_vars,
        changed_vars,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::step::test::descriptor;
    use crate::{DeclaredTargets, TargetTemplate};

    fn set<const N: usize>(names: [&str; N]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_local_vars() {
        let body = "x=1\nexport Y=2; for i in 1 2; do n+=1; done\nread -r line < f\nlocal z=3";
        assert_eq!(set(["Y", "i", "line", "n", "x", "z"]), local_vars(body));
        // comparisons are not assignments:
        assert!(local_vars("[ \"$a\" == b ]").is_empty());
    }

    #[test]
    fn test_environ_vars() -> Result<()> {
        let mut step = descriptor("count_1");
        step.body = "total=$(wc -l < $input)\necho $total $genome $HOME $SOS_SHARED".to_owned();
        step.code_vars = set(["total", "input", "genome", "HOME", "SOS_SHARED"]);
        step.options.shared.push("total".to_owned());
        let mut ns = Namespace::new();
        ns.insert("genome".to_owned(), "hg38".into());

        let a = analyze(&step, None, None, &ns, &Bindings::new())?;
        assert_eq!(set(["genome", "input"]), a.environ_vars);
        assert_eq!(set(["genome"]), a.signature_vars);
        assert_eq!(set(["total"]), a.changed_vars);
        Ok(())
    }

    #[test]
    fn test_default_input() -> Result<()> {
        let step = descriptor("b_2");
        let ns = Namespace::new();
        let prev = TargetSet::Determined(vec![Target::file("f1")]);

        let a = analyze(&step, Some(&prev), Some("b_1"), &ns, &Bindings::new())?;
        assert_eq!(prev, a.step_input);
        assert!(a.step_depends.is_empty());

        // nothing concrete to consume, so depend on the step itself:
        let a = analyze(
            &step,
            Some(&TargetSet::Undetermined),
            Some("b_1"),
            &ns,
            &Bindings::new(),
        )?;
        assert!(a.step_input.is_empty());
        assert_eq!(&[Target::step("b_1")], a.step_depends.targets());

        // an explicit input statement wins:
        let mut step = step;
        step.inputs = Some(DeclaredTargets {
            targets: vec![TargetTemplate::File("other".to_owned())],
            undetermined: false,
        });
        let a = analyze(&step, Some(&prev), Some("b_1"), &ns, &Bindings::new())?;
        assert_eq!(&[Target::file("other")], a.step_input.targets());
        Ok(())
    }

    #[test]
    fn test_bindings_and_undetermined() -> Result<()> {
        let mut step = descriptor("make_csv");
        step.outputs.targets.push(TargetTemplate::File("data/{year}.csv".to_owned()));
        let mut bindings = Bindings::new();
        bindings.insert("year".to_owned(), "2020".to_owned());
        let a = analyze(&step, None, None, &Namespace::new(), &bindings)?;
        assert_eq!(&[Target::file("data/2020.csv")], a.step_output.targets());

        step.outputs.undetermined = true;
        let a = analyze(&step, None, None, &Namespace::new(), &bindings)?;
        assert!(a.step_output.is_undetermined());
        Ok(())
    }

    #[test]
    fn test_undefined_variable() {
        let mut step = descriptor("x");
        step.depends.targets.push(TargetTemplate::File("$nope".to_owned()));
        let err = analyze(&step, None, None, &Namespace::new(), &Bindings::new()).unwrap_err();
        assert!(format!("{err:#}").contains("nope"));
    }
}

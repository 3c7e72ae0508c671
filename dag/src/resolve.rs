use anyhow::{Context as _, Result};
use serde_json::Value;
use workflow::{analyze, Bindings, Namespace, StepId, Target, TargetEnv, Workflow};

use crate::{Dag, NodeId, PlanError};

/// Finds auxiliary steps to produce targets that nothing in the graph produces.
pub struct Resolver<'a> {
    wf: &'a Workflow,
    auxiliary: &'a [StepId],
    ns: &'a Namespace,
}

impl<'a> Resolver<'a> {
    pub fn new(wf: &'a Workflow, auxiliary: &'a [StepId], ns: &'a Namespace) -> Self {
        Self { wf, auxiliary, ns }
    }

    /// Add nodes to `dag` until nothing it consumes (and nothing in `extra`)
    /// is left dangling. Returns the number of targets resolved.
    pub fn resolve(&self, dag: &mut Dag, extra: &[Target], env: &dyn TargetEnv) -> Result<usize> {
        let mut resolved = 0;
        loop {
            dag.build();
            let (unresolved, existing) = dag.dangling(extra, env)?;
            if !existing.is_empty() {
                log::trace!("consuming existing targets {existing:?}");
            }
            if unresolved.is_empty() {
                break;
            }
            for target in unresolved {
                // an earlier resolution in this pass may have covered it:
                if !dag.producers(&target).is_empty() {
                    continue;
                }
                self.resolve_one(dag, &target)?;
                resolved += 1;
            }
            dag.build();
            let cycle = dag.circular_dependencies();
            if !cycle.is_empty() {
                return Err(PlanError::Cycle(dag.describe_cycle(&cycle)).into());
            }
        }
        if resolved > 0 {
            log::info!("resolved {resolved} targets, graph has {} nodes", dag.len());
        }
        Ok(resolved)
    }

    fn resolve_one(&self, dag: &mut Dag, target: &Target) -> Result<()> {
        let mut matches = self.providers(target);
        match matches.len() {
            0 => Err(PlanError::Unsatisfiable(target.clone()).into()),
            1 => {
                let (step, bindings) = matches.swap_remove(0);
                self.add_provider(dag, step, bindings, vec![target.clone()], None)?;
                Ok(())
            }
            _ if matches!(target, Target::Step(_)) => {
                // a family of steps runs in order, the last one standing in for the target.
                let last = matches.len() - 1;
                let mut prev = None;
                for (i, (step, bindings)) in matches.into_iter().enumerate() {
                    let default_output = if i == last { vec![target.clone()] } else { vec![] };
                    let id = self.add_provider(dag, step, bindings, default_output, prev)?;
                    prev = Some(dag.node(id).name.clone());
                }
                Ok(())
            }
            _ => {
                let names: Vec<_> = matches
                    .iter()
                    .map(|(step, _)| self.wf.get_step(*step).name.as_str())
                    .collect();
                Err(PlanError::Ambiguous(target.clone(), names.join(", ")).into())
            }
        }
    }

    /// Auxiliary steps that can produce `target`, with the names each match binds.
    fn providers(&self, target: &Target) -> Vec<(StepId, Bindings)> {
        match target {
            Target::Step(name) => {
                if let Some(&exact) = self
                    .auxiliary
                    .iter()
                    .find(|&&id| self.wf.get_step(id).name == *name)
                {
                    return vec![(exact, Bindings::new())];
                }
                let mut family: Vec<_> = self
                    .auxiliary
                    .iter()
                    .filter_map(|&id| {
                        let step = self.wf.get_step(id);
                        (step.workflow == *name).then_some((step.index?, id))
                    })
                    .collect();
                family.sort();
                family.into_iter().map(|(_, id)| (id, Bindings::new())).collect()
            }
            _ => self
                .auxiliary
                .iter()
                .filter_map(|&id| {
                    let bindings = self.wf.get_step(id).provides(target, self.ns)?;
                    Some((id, bindings))
                })
                .collect(),
        }
    }

    fn add_provider(
        &self,
        dag: &mut Dag,
        step_id: StepId,
        bindings: Bindings,
        default_output: Vec<Target>,
        after: Option<String>,
    ) -> Result<NodeId> {
        let step = self.wf.get_step(step_id);
        let vars: Namespace = bindings
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        if let Some(existing) = dag.find(&step.uuid, &vars) {
            let node = dag.node_mut(existing);
            for target in default_output {
                if !node.context.default_output.contains(&target) {
                    node.context.default_output.push(target);
                }
            }
            return Ok(existing);
        }

        let mut analysis = analyze(step, None, None, self.ns, &bindings)
            .map_err(|e| PlanError::Malformed(step.name.clone(), format!("{e:#}")))
            .with_context(|| format!("while resolving a provider for {}", step.name))?;
        if let Some(prev) = after {
            analysis.step_depends.push(Target::step(prev));
        }
        log::debug!(
            "{} provides {:?} with {:?}",
            step.name,
            default_output,
            bindings
        );
        Ok(dag.add_step(step_id, step, analysis, vars, default_output))
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::graph::test::Env;
    use crate::{plan, Status};

    fn setup(script: &str, forward: &str) -> Result<(Workflow, Vec<StepId>, Dag)> {
        let wf = Workflow::load(syntax::parse(script)?, script)?;
        let fwd = wf.forward_steps(forward)?;
        let aux = wf.auxiliary_steps(forward);
        let dag = plan(&wf, &fwd, wf.globals())?;
        Ok((wf, aux, dag))
    }

    fn names(dag: &Dag) -> Vec<&str> {
        dag.nodes().map(|n| n.name.as_str()).collect()
    }

    #[test]
    fn test_pattern_provider() -> Result<()> {
        let script = r#"
step main_1 < "data/2020.csv" {
    wc -l data/2020.csv
}

step make_csv :: provides="data/{year}.csv" {
    echo $year > data/$year.csv
}
"#;
        let (wf, aux, mut dag) = setup(script, "main")?;
        let dir = tempfile::tempdir()?;
        let env = Env::new(dir.path());
        let n = Resolver::new(&wf, &aux, wf.globals()).resolve(&mut dag, &[], &env)?;
        assert_eq!(1, n);
        assert_eq!(vec!["main_1", "make_csv"], names(&dag));

        let provider = dag.node(NodeId::from(1usize));
        assert_eq!(Some(&Value::from("2020")), provider.context.vars.get("year"));
        assert_eq!(vec![Target::file("data/2020.csv")], provider.context.default_output);
        assert!(dag.preds(NodeId::from(0usize)).contains(&provider.id));
        assert_eq!(Some(provider.id), dag.find_executable());

        // nothing dangles any more, and a second pass is a no-op:
        assert!(dag.dangling(&[], &env)?.0.is_empty());
        assert_eq!(0, Resolver::new(&wf, &aux, wf.globals()).resolve(&mut dag, &[], &env)?);
        Ok(())
    }

    #[test]
    fn test_family_provider() -> Result<()> {
        let script = r#"
step main_1 ^ @align {
    echo main
}
step align_2 {
    echo two
}
step align_1 {
    echo one
}
step align_3 {
    echo three
}
"#;
        let (wf, aux, mut dag) = setup(script, "main")?;
        let dir = tempfile::tempdir()?;
        let env = Env::new(dir.path());
        Resolver::new(&wf, &aux, wf.globals()).resolve(&mut dag, &[], &env)?;
        assert_eq!(vec!["main_1", "align_1", "align_2", "align_3"], names(&dag));

        // runs in index order, main last:
        let mut order = Vec::new();
        while let Some(id) = dag.find_executable() {
            order.push(dag.node(id).name.clone());
            dag.set_status(id, Status::Completed);
        }
        assert_eq!(vec!["align_1", "align_2", "align_3", "main_1"], order);
        Ok(())
    }

    #[test]
    fn test_unsatisfiable_and_ambiguous() -> Result<()> {
        let script = r#"
step main_1 < "ref.fa" "other.txt" {
    cat ref.fa
}
step get_a :: provides=ref.fa {
    echo a
}
step get_b :: provides="*.fa" {
    echo b
}
"#;
        let (wf, aux, mut dag) = setup(script, "main")?;
        let dir = tempfile::tempdir()?;
        let env = Env::new(dir.path());
        // targets resolve in order, so other.txt fails first:
        let err = Resolver::new(&wf, &aux, wf.globals())
            .resolve(&mut dag, &[], &env)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<PlanError>(),
            Some(PlanError::Unsatisfiable(t)) if *t == Target::file("other.txt")
        ));

        std::fs::write(dir.path().join("other.txt"), "")?;
        let err = Resolver::new(&wf, &aux, wf.globals())
            .resolve(&mut dag, &[], &env)
            .unwrap_err();
        match err.downcast_ref::<PlanError>() {
            Some(PlanError::Ambiguous(target, names)) => {
                assert_eq!(&Target::file("ref.fa"), target);
                assert_eq!("get_a, get_b", names);
            }
            other => panic!("unexpected error {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn test_cycle_is_detected() -> Result<()> {
        let script = r#"
step main_1 > "a.txt" {
    echo a > a.txt
}
step main_2 < "a.txt" "b.txt" {
    cat a.txt b.txt
}
step make_b < "c.txt" :: provides=b.txt {
    cp c.txt b.txt
}
step make_c ^ @main_2 :: provides=c.txt {
    touch c.txt
}
"#;
        let (wf, aux, mut dag) = setup(script, "main")?;
        let dir = tempfile::tempdir()?;
        let env = Env::new(dir.path());
        let err = Resolver::new(&wf, &aux, wf.globals())
            .resolve(&mut dag, &[], &env)
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<PlanError>(), Some(PlanError::Cycle(_))));
        Ok(())
    }

    #[test]
    fn test_shared_variable_provider() -> Result<()> {
        let script = r#"
step main_1 ^ $count {
    echo $count
}
step counter :: shared=count {
    echo "count=3" >> "$SOS_SHARED"
}
"#;
        let (wf, aux, mut dag) = setup(script, "main")?;
        let dir = tempfile::tempdir()?;
        let env = Env::new(dir.path());
        Resolver::new(&wf, &aux, wf.globals()).resolve(&mut dag, &[], &env)?;
        assert_eq!(vec!["main_1", "counter"], names(&dag));
        Ok(())
    }
}

use anyhow::Result;
use workflow::{analyze, Bindings, Namespace, StepId, TargetSet, Workflow};

use crate::Dag;

/// Build the initial graph for the forward steps `forward`, in order.
///
/// Each step without its own input statement consumes the outputs of the
/// step before it.
pub fn plan(wf: &Workflow, forward: &[StepId], ns: &Namespace) -> Result<Dag> {
    let mut dag = Dag::new();
    let mut prev: Option<(TargetSet, &str)> = None;
    for &id in forward {
        let step = wf.get_step(id);
        let analysis = analyze(
            step,
            prev.as_ref().map(|(output, _)| output),
            prev.as_ref().map(|(_, name)| *name),
            ns,
            &Bindings::new(),
        )?;
        let output = analysis.step_output.clone();
        dag.add_step(id, step, analysis, Namespace::new(), Vec::with_capacity(0));
        prev = Some((output, step.name.as_str()));
    }
    dag.build();
    log::info!("planned {} forward steps", dag.len());
    Ok(dag)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::NodeId;
    use std::collections::BTreeSet;
    use workflow::Target;

    const SCRIPT: &str = r#"
step a_1 > "f1" {
    echo one > f1
}

step a_2 {
    cat f1 > f2
}

step a_3 > ? {
    ls
}

step a_4 {
    echo done
}
"#;

    #[test]
    fn test_plan_default_inputs() -> Result<()> {
        let wf = Workflow::load(syntax::parse(SCRIPT)?, SCRIPT)?;
        let forward = wf.forward_steps("a")?;
        let dag = plan(&wf, &forward, wf.globals())?;
        assert_eq!(4, dag.len());

        let node = |i: usize| dag.node(NodeId::from(i));
        // a_2 takes f1 from a_1:
        assert_eq!(&[Target::file("f1")], node(1).inputs.targets());
        // a_3 has nothing concrete from a_2, so depends on it:
        assert_eq!(&[Target::step("a_2")], node(2).depends.targets());
        // a_4 can't see through a_3's undetermined output:
        assert_eq!(&[Target::step("a_3")], node(3).depends.targets());

        for i in 1..4 {
            assert_eq!(
                &BTreeSet::from([NodeId::from(i - 1)]),
                dag.preds(NodeId::from(i))
            );
        }
        Ok(())
    }
}

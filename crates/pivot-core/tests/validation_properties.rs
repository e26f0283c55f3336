use pivot_core::domain::instantiation::InstanceStarter;
use pivot_core::migration::instance_validation::validate_instance;
use pivot_core::{
    ActivityId, FixedClock, JmesPathExpressionEvaluator, MigrationPlan, MigrationPlanBuilder,
    MigrationTransformer, ProcessDefinition,
};
use pivot_test_utils::{ProcessModels, TestEngine};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

fn mapping(targets: &'static [&'static str]) -> impl Strategy<Value = Option<&'static str>> {
    prop::option::of(prop::sample::select(targets))
}

fn plan_with(
    source: &Arc<ProcessDefinition>,
    target: &Arc<ProcessDefinition>,
    instructions: &[(&str, Option<&'static str>)],
) -> MigrationPlanBuilder {
    instructions.iter().fold(
        MigrationPlan::builder(source.clone(), target.clone()),
        |builder, (from, to)| match to {
            Some(to) => builder.map_activities(*from, *to),
            None => builder,
        },
    )
}

const PARALLEL: &[&str] = &["subProcess1", "subProcess2", "userTask1", "userTask2"];
const NESTED: &[&str] = &["outerSubProcess", "innerSubProcess", "userTask"];

proptest! {
    #[test]
    fn validation_is_repeatable(
        sub1 in mapping(PARALLEL),
        sub2 in mapping(PARALLEL),
        task1 in mapping(PARALLEL),
        task2 in mapping(PARALLEL),
    ) {
        let source = Arc::new(ProcessModels::parallel_subprocesses("source"));
        let target = Arc::new(ProcessModels::parallel_subprocesses("target"));
        let instructions = [
            ("subProcess1", sub1),
            ("subProcess2", sub2),
            ("userTask1", task1),
            ("userTask2", task2),
        ];

        let first = plan_with(&source, &target, &instructions).build();
        let second = plan_with(&source, &target, &instructions).build();
        prop_assert_eq!(first.is_ok(), second.is_ok());
        prop_assert_eq!(first.err(), second.err());
    }

    #[test]
    fn valid_plans_nest_children_below_parents(
        outer in mapping(NESTED),
        inner in mapping(NESTED),
        task in mapping(NESTED),
    ) {
        let source = Arc::new(ProcessModels::double_subprocess("source"));
        let target = Arc::new(ProcessModels::double_subprocess("target"));
        let instructions = [
            ("outerSubProcess", outer),
            ("innerSubProcess", inner),
            ("userTask", task),
        ];
        let Ok(plan) = plan_with(&source, &target, &instructions).build() else {
            return Ok(());
        };

        let clock = FixedClock::new(TestEngine::epoch());
        let evaluator = JmesPathExpressionEvaluator::new();
        let starter = InstanceStarter::new(&source, &evaluator, &clock);
        let mut instance = starter.start("pi".into(), None, BTreeMap::new()).unwrap();
        starter.start_before(&mut instance, &ActivityId::from("userTask")).unwrap();
        if validate_instance(&instance, &plan).is_err() {
            return Ok(());
        }

        let outcome = MigrationTransformer::new(&plan, &evaluator, &clock)
            .migrate(&instance)
            .unwrap();
        let migrated = outcome.instance;
        prop_assert!(migrated.verify_against(&target).is_ok());
        for execution in migrated.executions.values() {
            if let Some(parent) = execution.parent_id.as_ref().and_then(|p| migrated.execution(p)) {
                prop_assert!(target.is_ancestor(&parent.activity_id, &execution.activity_id));
            }
        }
        prop_assert_eq!(
            migrated.executions_in(&ActivityId::from("userTask")).len(),
            usize::from(task == Some("userTask"))
        );
    }

    #[test]
    fn joining_gateway_keeps_its_tokens(source_incoming in 1usize..6, target_incoming in 1usize..6) {
        let source = Arc::new(ProcessModels::parallel_gateway("source", source_incoming));
        let target = Arc::new(ProcessModels::parallel_gateway("target", target_incoming));

        let built = MigrationPlan::builder(source, target)
            .map_activities("join", "join")
            .build();
        prop_assert_eq!(built.is_ok(), target_incoming >= source_incoming);
    }
}

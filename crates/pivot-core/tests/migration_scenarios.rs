use chrono::Duration;
use pivot_core::domain::process_instance::{
    IncidentState, SubscriptionKind, LOOP_COUNTER, NR_OF_INSTANCES,
};
use pivot_core::{ActivityId, Clock, EventDefinition, MigrationError, TypedValue};
use pivot_test_utils::assertions::{
    assert_active_activities, assert_activity_tree, assert_consistent_with, assert_execution_count,
};
use pivot_test_utils::{ProcessModels, TestEngine};
use pretty_assertions::assert_eq;
use serde_json::json;

#[tokio::test]
async fn test_same_shape_migration_completes_normally() {
    let engine = TestEngine::new();
    let source = engine.deploy(ProcessModels::one_task("source")).await.unwrap();
    let target = engine.deploy(ProcessModels::one_task("target")).await.unwrap();
    let before = engine.start_before(&source, "pi", &["userTask"]).await.unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_equal_activities()
        .build()
        .unwrap();
    assert_eq!(plan.instructions().len(), 1);
    let report = engine.migrate(&plan, &["pi"]).await.unwrap();
    assert!(report.is_success());

    let migrated = engine.instance("pi").await.unwrap();
    assert_eq!(migrated.process_definition_id, target.id);
    assert_activity_tree(&migrated, "target[userTask]").unwrap();
    assert_eq!(
        migrated.executions.keys().collect::<Vec<_>>(),
        before.executions.keys().collect::<Vec<_>>()
    );
    assert_consistent_with(&migrated, &target).unwrap();

    let completed = engine.complete("pi", "userTask").await.unwrap();
    assert!(completed.is_ended());
}

#[tokio::test]
async fn test_added_parent_scope() {
    let engine = TestEngine::new();
    let source = engine.deploy(ProcessModels::one_task("source")).await.unwrap();
    let target = engine.deploy(ProcessModels::subprocess("target")).await.unwrap();
    engine.start_before(&source, "pi", &["userTask"]).await.unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_activities("userTask", "userTask")
        .build()
        .unwrap();
    engine.migrate(&plan, &["pi"]).await.unwrap();

    let migrated = engine.instance("pi").await.unwrap();
    assert_activity_tree(&migrated, "target[subProcess[userTask]]").unwrap();
    assert_execution_count(&migrated, "userTask", 1).unwrap();

    let completed = engine.complete("pi", "userTask").await.unwrap();
    assert!(completed.is_ended());
}

#[tokio::test]
async fn test_removed_parent_scope() {
    let engine = TestEngine::new();
    let source = engine.deploy(ProcessModels::double_subprocess("source")).await.unwrap();
    let target = engine.deploy(ProcessModels::subprocess("target")).await.unwrap();
    engine.start_before(&source, "pi", &["userTask"]).await.unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_activities("outerSubProcess", "subProcess")
        .map_activities("userTask", "userTask")
        .build()
        .unwrap();
    engine.migrate(&plan, &["pi"]).await.unwrap();

    let migrated = engine.instance("pi").await.unwrap();
    assert_activity_tree(&migrated, "target[subProcess[userTask]]").unwrap();
}

#[tokio::test]
async fn test_multi_instance_body_removal() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::parallel_multi_instance("source"))
        .await
        .unwrap();
    let target = engine.deploy(ProcessModels::one_task("target")).await.unwrap();
    engine
        .start_multi_instance(&source, "pi", "userTask", 3)
        .await
        .unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_activities("userTask", "userTask")
        .build()
        .unwrap();
    engine.migrate(&plan, &["pi"]).await.unwrap();

    let migrated = engine.instance("pi").await.unwrap();
    assert_activity_tree(&migrated, "target[userTask, userTask, userTask]").unwrap();
    let tasks = migrated.executions_in(&ActivityId::from("userTask"));
    assert_eq!(tasks.len(), 3);
    for task in &tasks {
        assert!(task.is_concurrent);
        assert!(!task.is_scope);
        assert_eq!(task.parent_id.as_ref(), Some(&migrated.root_execution));
    }
    let mut counters: Vec<i64> = tasks
        .iter()
        .filter_map(|t| t.variable(LOOP_COUNTER).and_then(|v| v.as_i64()))
        .collect();
    counters.sort();
    assert_eq!(counters, vec![0, 1, 2]);
    assert!(migrated
        .executions
        .values()
        .all(|e| e.variable(NR_OF_INSTANCES).is_none()));
}

#[tokio::test]
async fn test_sequential_multi_instance_keeps_body_counters() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::sequential_multi_instance("source"))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::sequential_multi_instance("target"))
        .await
        .unwrap();
    engine
        .start_multi_instance(&source, "pi", "userTask", 3)
        .await
        .unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_equal_activities()
        .build()
        .unwrap();
    assert_eq!(plan.instructions().len(), 2);
    engine.migrate(&plan, &["pi"]).await.unwrap();

    let migrated = engine.instance("pi").await.unwrap();
    assert_activity_tree(&migrated, "target[userTask#multiInstanceBody[userTask]]").unwrap();
    let body = migrated.executions_in(&ActivityId::from("userTask#multiInstanceBody"))[0];
    assert_eq!(body.variable(NR_OF_INSTANCES).and_then(|v| v.as_i64()), Some(3));
}

#[tokio::test]
async fn test_timer_due_date_with_and_without_trigger_update() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::timer_catch("source", "PT10M"))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::timer_catch("target", "PT1H"))
        .await
        .unwrap();
    engine.start_before(&source, "keep", &["timerCatch"]).await.unwrap();
    engine.start_before(&source, "update", &["timerCatch"]).await.unwrap();
    engine.clock.advance(Duration::minutes(5));

    let keep = engine
        .plan(&source, &target)
        .map_activities("timerCatch", "timerCatch")
        .build()
        .unwrap();
    let update = engine
        .plan(&source, &target)
        .map_activities("timerCatch", "timerCatch")
        .update_event_trigger()
        .build()
        .unwrap();
    engine.migrate(&keep, &["keep"]).await.unwrap();
    engine.migrate(&update, &["update"]).await.unwrap();

    let kept = engine.instance("keep").await.unwrap();
    assert_eq!(kept.timer_jobs.len(), 1);
    assert_eq!(
        kept.timer_jobs[0].due_date,
        TestEngine::epoch() + Duration::minutes(10)
    );

    let updated = engine.instance("update").await.unwrap();
    assert_eq!(updated.timer_jobs.len(), 1);
    assert_eq!(
        updated.timer_jobs[0].due_date,
        engine.clock.now() + Duration::hours(1)
    );
    assert_eq!(updated.timer_jobs[0].process_definition_id, target.id);
}

#[tokio::test]
async fn test_suspended_instance_keeps_suspended_timers() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::timer_boundary("source", "PT10M"))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::timer_boundary("target", "PT10M"))
        .await
        .unwrap();
    let mut instance = engine.start_before(&source, "pi", &["userTask"]).await.unwrap();
    instance.set_suspended(true);
    engine.store(&instance).await.unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_equal_activities()
        .update_event_triggers()
        .build()
        .unwrap();
    engine.migrate(&plan, &["pi"]).await.unwrap();

    let migrated = engine.instance("pi").await.unwrap();
    assert!(migrated.suspended);
    assert!(migrated.timer_jobs.iter().all(|j| j.suspended));
}

#[tokio::test]
async fn test_horizontal_scope_swap_is_rejected() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::parallel_subprocesses("source"))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::parallel_subprocesses("target"))
        .await
        .unwrap();

    let err = engine
        .plan(&source, &target)
        .map_activities("subProcess1", "subProcess1")
        .map_activities("subProcess2", "subProcess2")
        .map_activities("userTask1", "userTask2")
        .map_activities("userTask2", "userTask1")
        .build()
        .unwrap_err();

    let MigrationError::InvalidPlan(report) = err else {
        panic!("expected an invalid plan, got {:?}", err);
    };
    assert_eq!(
        report.instruction_failures("userTask1"),
        vec!["The closest mapped ancestor 'subProcess1' is mapped to scope 'subProcess1' which is not an ancestor of target scope 'userTask2'"]
    );
    assert_eq!(
        report.instruction_failures("userTask2"),
        vec!["The closest mapped ancestor 'subProcess2' is mapped to scope 'subProcess2' which is not an ancestor of target scope 'userTask1'"]
    );
    assert!(report.instruction_failures("subProcess1").is_empty());
}

#[tokio::test]
async fn test_boundary_subscription_keeps_identity() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::boundary_event("source", EventDefinition::message("Cancel")))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::boundary_event("target", EventDefinition::message("Abort")))
        .await
        .unwrap();
    let before = engine.start_before(&source, "pi", &["userTask"]).await.unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_equal_activities()
        .build()
        .unwrap();
    engine.migrate(&plan, &["pi"]).await.unwrap();

    let migrated = engine.instance("pi").await.unwrap();
    assert_eq!(migrated.event_subscriptions.len(), 1);
    let subscription = &migrated.event_subscriptions[0];
    assert_eq!(subscription.id, before.event_subscriptions[0].id);
    assert_eq!(subscription.event_name.as_deref(), Some("Cancel"));
    assert_eq!(subscription.activity_id, ActivityId::from("boundary"));
}

#[tokio::test]
async fn test_added_event_sub_process_is_subscribed() {
    let engine = TestEngine::new();
    let source = engine.deploy(ProcessModels::one_task("source")).await.unwrap();
    let target = engine
        .deploy(ProcessModels::event_subprocess(
            "target",
            EventDefinition::message("Escalate"),
        ))
        .await
        .unwrap();
    engine.start_before(&source, "pi", &["userTask"]).await.unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_activities("userTask", "userTask")
        .build()
        .unwrap();
    engine.migrate(&plan, &["pi"]).await.unwrap();

    let migrated = engine.instance("pi").await.unwrap();
    assert_eq!(migrated.event_subscriptions.len(), 1);
    let subscription = &migrated.event_subscriptions[0];
    assert_eq!(subscription.kind, SubscriptionKind::Message);
    assert_eq!(subscription.activity_id, ActivityId::from("eventSubProcessStart"));
    assert_eq!(subscription.execution_id, migrated.root_execution);
    assert_eq!(subscription.event_name.as_deref(), Some("Escalate"));
}

#[tokio::test]
async fn test_removed_event_sub_process_is_unsubscribed() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::event_subprocess(
            "source",
            EventDefinition::signal("Alarm"),
        ))
        .await
        .unwrap();
    let target = engine.deploy(ProcessModels::one_task("target")).await.unwrap();
    let before = engine.start_before(&source, "pi", &["userTask"]).await.unwrap();
    assert_eq!(before.event_subscriptions.len(), 1);

    let plan = engine
        .plan(&source, &target)
        .map_activities("userTask", "userTask")
        .build()
        .unwrap();
    engine.migrate(&plan, &["pi"]).await.unwrap();

    let migrated = engine.instance("pi").await.unwrap();
    assert!(migrated.event_subscriptions.is_empty());
}

#[tokio::test]
async fn test_external_task_and_incident_relocation() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::external_task("source", "billing"))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::external_task("target", "invoicing"))
        .await
        .unwrap();
    let mut instance = engine.start_before(&source, "pi", &["externalTask"]).await.unwrap();
    let task_id = instance.external_tasks[0].id.clone();
    let now = engine.clock.now();
    instance
        .lock_external_task(&task_id, "worker-1", now + Duration::minutes(5))
        .unwrap();
    let incident_id = instance.fail_external_task(&task_id, "boom", now).unwrap();
    engine.store(&instance).await.unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_activities("externalTask", "externalTask")
        .build()
        .unwrap();
    engine.migrate(&plan, &["pi"]).await.unwrap();

    let migrated = engine.instance("pi").await.unwrap();
    let task = &migrated.external_tasks[0];
    assert_eq!(task.id, task_id);
    assert_eq!(task.process_definition_id, target.id);
    assert_eq!(task.process_definition_key, "target");
    assert_eq!(task.topic, "billing");
    assert_eq!(task.worker_id.as_deref(), Some("worker-1"));
    assert_eq!(task.retries, Some(0));
    assert_eq!(task.error_message.as_deref(), Some("boom"));

    let incident = &migrated.incidents[0];
    assert_eq!(incident.id, incident_id);
    assert_eq!(incident.state, IncidentState::Open);
    assert_eq!(incident.process_definition_id, target.id);
    assert_eq!(incident.activity_id, ActivityId::from("externalTask"));
    assert_eq!(incident.execution_id, task.execution_id);
}

#[tokio::test]
async fn test_incident_of_removed_subtree_is_deleted() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::external_task_in_subprocess("source", "billing"))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::external_task_in_subprocess("target", "billing"))
        .await
        .unwrap();
    let mut instance = engine.start_before(&source, "pi", &["externalTask"]).await.unwrap();
    let task_id = instance.external_tasks[0].id.clone();
    instance
        .fail_external_task(&task_id, "boom", engine.clock.now())
        .unwrap();
    engine.store(&instance).await.unwrap();

    let plan = engine.plan(&source, &target).build().unwrap();
    engine.migrate(&plan, &["pi"]).await.unwrap();

    let migrated = engine.instance("pi").await.unwrap();
    assert_active_activities(&migrated, &[]).unwrap();
    assert!(migrated.external_tasks.is_empty());
    assert_eq!(migrated.incidents[0].state, IncidentState::Deleted);
    assert!(migrated.incidents[0].resolved_at.is_some());
}

#[tokio::test]
async fn test_compensation_subscription_follows_mapped_boundary() {
    let engine = TestEngine::new();
    let source = engine.deploy(ProcessModels::compensation("source")).await.unwrap();
    let target = engine.deploy(ProcessModels::compensation("target")).await.unwrap();
    let mut instance = engine.start_before(&source, "pi", &["userTask2"]).await.unwrap();
    let root = instance.root_execution.clone();
    let subscription_id = instance
        .add_compensation_subscription("compensationHandler".into(), &root, engine.clock.now())
        .unwrap();
    engine.store(&instance).await.unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_activities("userTask2", "userTask2")
        .map_activities("compensationBoundary", "compensationBoundary")
        .build()
        .unwrap();
    let report = engine.migrate(&plan, &["pi"]).await.unwrap();
    assert!(report.is_success());

    let migrated = engine.instance("pi").await.unwrap();
    let subscription = &migrated.event_subscriptions[0];
    assert_eq!(subscription.id, subscription_id);
    assert_eq!(subscription.kind, SubscriptionKind::Compensate);
    assert_eq!(subscription.activity_id, ActivityId::from("compensationHandler"));
    assert_eq!(subscription.execution_id, migrated.root_execution);
}

#[tokio::test]
async fn test_compensation_subscription_without_boundary_instruction_is_rejected() {
    let engine = TestEngine::new();
    let source = engine.deploy(ProcessModels::compensation("source")).await.unwrap();
    let target = engine.deploy(ProcessModels::compensation("target")).await.unwrap();
    let mut instance = engine.start_before(&source, "pi", &["userTask2"]).await.unwrap();
    let root = instance.root_execution.clone();
    instance
        .add_compensation_subscription("compensationHandler".into(), &root, engine.clock.now())
        .unwrap();
    engine.store(&instance).await.unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_activities("userTask2", "userTask2")
        .build()
        .unwrap();
    let report = engine.migrate(&plan, &["pi"]).await.unwrap();

    let Some(MigrationError::InstanceValidation(failure)) = report.failure("pi") else {
        panic!("expected an instance validation failure: {:?}", report);
    };
    assert_eq!(
        failure.activity_instance_failures("source"),
        vec!["Cannot migrate subscription for compensation handler 'compensationHandler'. There is no migration instruction for the compensation boundary event"]
    );
    let unchanged = engine.instance("pi").await.unwrap();
    assert_eq!(unchanged.process_definition_id, source.id);
}

#[tokio::test]
async fn test_compensation_subscription_of_completed_scope_follows_the_scope() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::compensation_in_subprocess("source"))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::compensation_in_subprocess("target"))
        .await
        .unwrap();
    let mut instance = engine.start_before(&source, "pi", &["userTask2"]).await.unwrap();
    let root = instance.root_execution.clone();
    let subscription_id = instance
        .add_compensation_subscription("subProcess".into(), &root, engine.clock.now())
        .unwrap();
    engine.store(&instance).await.unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_activities("subProcess", "subProcess")
        .map_activities("userTask2", "userTask2")
        .build()
        .unwrap();
    let report = engine.migrate(&plan, &["pi"]).await.unwrap();
    assert!(report.is_success());

    let migrated = engine.instance("pi").await.unwrap();
    assert_eq!(migrated.event_subscriptions.len(), 1);
    let subscription = &migrated.event_subscriptions[0];
    assert_eq!(subscription.id, subscription_id);
    assert_eq!(subscription.kind, SubscriptionKind::Compensate);
    assert_eq!(subscription.activity_id, ActivityId::from("subProcess"));
    assert_eq!(subscription.execution_id, migrated.root_execution);
}

#[tokio::test]
async fn test_compensation_subscription_of_unmapped_completed_scope_is_rejected() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::compensation_in_subprocess("source"))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::compensation_in_subprocess("target"))
        .await
        .unwrap();
    let mut instance = engine.start_before(&source, "pi", &["userTask2"]).await.unwrap();
    let root = instance.root_execution.clone();
    instance
        .add_compensation_subscription("subProcess".into(), &root, engine.clock.now())
        .unwrap();
    engine.store(&instance).await.unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_activities("userTask2", "userTask2")
        .build()
        .unwrap();
    let report = engine.migrate(&plan, &["pi"]).await.unwrap();

    let Some(MigrationError::InstanceValidation(failure)) = report.failure("pi") else {
        panic!("expected an instance validation failure: {:?}", report);
    };
    assert_eq!(
        failure.activity_instance_failures("source"),
        vec!["Cannot migrate subscription for compensation of scope 'subProcess'. There is no migration instruction for the scope"]
    );
    let unchanged = engine.instance("pi").await.unwrap();
    assert_eq!(unchanged.event_subscriptions.len(), 1);
    assert_eq!(unchanged.process_definition_id, source.id);
}

#[tokio::test]
async fn test_gateway_with_fewer_incoming_flows_is_rejected() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::parallel_gateway("source", 2))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::parallel_gateway("target", 1))
        .await
        .unwrap();

    let err = engine
        .plan(&source, &target)
        .map_activities("join", "join")
        .build()
        .unwrap_err();
    let MigrationError::InvalidPlan(report) = err else {
        panic!("expected an invalid plan");
    };
    assert_eq!(
        report.instruction_failures("join"),
        vec!["The target gateway must have at least the same number of incoming sequence flows that the source gateway has"]
    );
}

#[tokio::test]
async fn test_event_sub_process_cannot_move_into_new_subprocess() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::event_subprocess("source", EventDefinition::message("Escalate")))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::event_subprocess_in_subprocess(
            "target",
            EventDefinition::message("Escalate"),
        ))
        .await
        .unwrap();

    let err = engine
        .plan(&source, &target)
        .map_activities("userTask", "userTask")
        .map_activities("eventSubProcess", "eventSubProcess")
        .map_activities("eventSubProcessStart", "eventSubProcessStart")
        .build()
        .unwrap_err();
    let MigrationError::InvalidPlan(report) = err else {
        panic!("expected an invalid plan");
    };
    let expected = vec![
        "The source activity's event scope (source) must be mapped to the target activity's event scope (subProcess)",
    ];
    assert_eq!(report.instruction_failures("eventSubProcess"), expected);
    assert_eq!(report.instruction_failures("eventSubProcessStart"), expected);
    assert!(report.instruction_failures("userTask").is_empty());
}

#[tokio::test]
async fn test_waiting_gateway_token_is_migrated() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::parallel_gateway("source", 2))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::parallel_gateway("target", 3))
        .await
        .unwrap();
    engine
        .start_before(&source, "pi", &["join", "userTask2"])
        .await
        .unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_equal_activities()
        .build()
        .unwrap();
    engine.migrate(&plan, &["pi"]).await.unwrap();

    let migrated = engine.instance("pi").await.unwrap();
    assert_active_activities(&migrated, &["join", "userTask2"]).unwrap();
}

#[tokio::test]
async fn test_plan_variables_and_transient_trigger_values() {
    let engine = TestEngine::new();
    let source = engine
        .deploy(ProcessModels::boundary_event("source", EventDefinition::message("Msg")))
        .await
        .unwrap();
    let target = engine
        .deploy(ProcessModels::boundary_event(
            "target",
            EventDefinition::message("Msg-${ticket}"),
        ))
        .await
        .unwrap();
    engine.start_before(&source, "pi", &["userTask"]).await.unwrap();

    let plan = engine
        .plan(&source, &target)
        .map_activities("userTask", "userTask")
        .map_activities("boundary", "boundary")
        .update_event_trigger()
        .set_variable("migratedBy", "ops")
        .set_variable("ticket", TypedValue::transient(json!("42")))
        .build()
        .unwrap();
    engine.migrate(&plan, &["pi"]).await.unwrap();

    let migrated = engine.instance("pi").await.unwrap();
    assert_eq!(
        migrated.event_subscriptions[0].event_name.as_deref(),
        Some("Msg-42")
    );
    let root = &migrated.root_execution;
    assert_eq!(
        migrated.variable(root, "migratedBy").and_then(|v| v.as_str()),
        Some("ops")
    );
    assert!(migrated.variable(root, "ticket").is_none());
}

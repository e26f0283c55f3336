//! Process models shared by the migration tests.
//!
//! Every model takes the definition key, so that a source and a target
//! version of the same shape get distinct definition ids (`<key>:1`).

use pivot_core::domain::process_definition::ProcessDefinitionBuilder;
use pivot_core::domain::timer::TimerDefinition;
use pivot_core::{Activity, EventDefinition, MultiInstanceMode, ProcessDefinition};

fn finish(builder: ProcessDefinitionBuilder) -> ProcessDefinition {
    builder.build().expect("fixture model is valid")
}

/// Fixture process models
pub struct ProcessModels;

impl ProcessModels {
    /// `start -> userTask -> end`
    pub fn one_task(key: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::start_event("startEvent"))
                .activity(Activity::user_task("userTask"))
                .activity(Activity::end_event("endEvent")),
        )
    }

    /// `userTask` inside `subProcess`
    pub fn subprocess(key: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::start_event("startEvent"))
                .activity(Activity::sub_process("subProcess"))
                .activity(Activity::user_task("userTask").in_scope("subProcess"))
                .activity(Activity::end_event("endEvent")),
        )
    }

    /// `userTask` inside `innerSubProcess` inside `outerSubProcess`
    pub fn double_subprocess(key: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::sub_process("outerSubProcess"))
                .activity(Activity::sub_process("innerSubProcess").in_scope("outerSubProcess"))
                .activity(Activity::user_task("userTask").in_scope("innerSubProcess")),
        )
    }

    /// Two sibling sub processes, each with one task
    pub fn parallel_subprocesses(key: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::sub_process("subProcess1"))
                .activity(Activity::user_task("userTask1").in_scope("subProcess1"))
                .activity(Activity::sub_process("subProcess2"))
                .activity(Activity::user_task("userTask2").in_scope("subProcess2")),
        )
    }

    /// Parallel multi-instance `userTask`
    pub fn parallel_multi_instance(key: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::user_task("userTask"))
                .multi_instance("userTask", MultiInstanceMode::Parallel),
        )
    }

    /// Sequential multi-instance `userTask`
    pub fn sequential_multi_instance(key: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::user_task("userTask"))
                .multi_instance("userTask", MultiInstanceMode::Sequential),
        )
    }

    /// Parallel multi-instance sub process around `userTask`
    pub fn parallel_multi_instance_subprocess(key: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::sub_process("subProcess"))
                .activity(Activity::user_task("userTask").in_scope("subProcess"))
                .multi_instance("subProcess", MultiInstanceMode::Parallel),
        )
    }

    /// Two tasks joined by a parallel gateway with `incoming` flows
    pub fn parallel_gateway(key: &str, incoming: usize) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::user_task("userTask1"))
                .activity(Activity::user_task("userTask2"))
                .activity(Activity::parallel_gateway("join", incoming))
                .activity(Activity::user_task("afterJoin")),
        )
    }

    /// Parallel join gateway inside `subProcess`
    pub fn parallel_gateway_in_subprocess(key: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::sub_process("subProcess"))
                .activity(Activity::user_task("userTask1").in_scope("subProcess"))
                .activity(Activity::user_task("userTask2").in_scope("subProcess"))
                .activity(Activity::parallel_gateway("join", 2).in_scope("subProcess")),
        )
    }

    /// `userTask` with a boundary event
    pub fn boundary_event(key: &str, event: EventDefinition) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::user_task("userTask"))
                .activity(Activity::boundary_event("boundary", "userTask", event))
                .activity(Activity::user_task("afterBoundaryTask")),
        )
    }

    /// `userTask` with a timer boundary event firing after `duration`
    pub fn timer_boundary(key: &str, duration: &str) -> ProcessDefinition {
        Self::boundary_event(
            key,
            EventDefinition::timer(TimerDefinition::Duration(duration.to_string())),
        )
    }

    /// Intermediate timer catch event waiting `duration`
    pub fn timer_catch(key: &str, duration: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::intermediate_catch_event(
                    "timerCatch",
                    EventDefinition::timer(TimerDefinition::Duration(duration.to_string())),
                ))
                .activity(Activity::user_task("userTask")),
        )
    }

    /// Receive task waiting for `message`
    pub fn receive_task(key: &str, message: &str) -> ProcessDefinition {
        finish(ProcessDefinition::builder(key).activity(Activity::receive_task("receiveTask", message)))
    }

    /// `userTask` next to an event sub process started by `event`
    pub fn event_subprocess(key: &str, event: EventDefinition) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::user_task("userTask"))
                .activity(Activity::event_sub_process("eventSubProcess"))
                .activity(
                    Activity::triggered_start_event("eventSubProcessStart", event)
                        .in_scope("eventSubProcess"),
                )
                .activity(Activity::user_task("eventSubProcessTask").in_scope("eventSubProcess")),
        )
    }

    /// Like [`ProcessModels::event_subprocess`] with everything moved into `subProcess`
    pub fn event_subprocess_in_subprocess(key: &str, event: EventDefinition) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::sub_process("subProcess"))
                .activity(Activity::user_task("userTask").in_scope("subProcess"))
                .activity(Activity::event_sub_process("eventSubProcess").in_scope("subProcess"))
                .activity(
                    Activity::triggered_start_event("eventSubProcessStart", event)
                        .in_scope("eventSubProcess"),
                )
                .activity(Activity::user_task("eventSubProcessTask").in_scope("eventSubProcess")),
        )
    }

    /// `userTask1` with a compensation handler, followed by `userTask2` and a
    /// compensation throw event
    pub fn compensation(key: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::user_task("userTask1"))
                .activity(Activity::compensation_boundary_event(
                    "compensationBoundary",
                    "userTask1",
                    "compensationHandler",
                ))
                .activity(Activity::user_task("compensationHandler").for_compensation())
                .activity(Activity::user_task("userTask2"))
                .activity(Activity::intermediate_throw_event(
                    "compensationEvent",
                    EventDefinition::compensation(),
                )),
        )
    }

    /// `subProcess` holding `userTask1` with a compensation handler, followed
    /// by `userTask2`
    pub fn compensation_in_subprocess(key: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::sub_process("subProcess"))
                .activity(Activity::user_task("userTask1").in_scope("subProcess"))
                .activity(Activity::compensation_boundary_event(
                    "compensationBoundary",
                    "userTask1",
                    "compensationHandler",
                ))
                .activity(
                    Activity::user_task("compensationHandler")
                        .for_compensation()
                        .in_scope("subProcess"),
                )
                .activity(Activity::user_task("userTask2")),
        )
    }

    /// External task on `topic`
    pub fn external_task(key: &str, topic: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::external_task("externalTask", topic))
                .activity(Activity::user_task("userTask")),
        )
    }

    /// External task on `topic` inside `subProcess`
    pub fn external_task_in_subprocess(key: &str, topic: &str) -> ProcessDefinition {
        finish(
            ProcessDefinition::builder(key)
                .activity(Activity::sub_process("subProcess"))
                .activity(Activity::external_task("externalTask", topic).in_scope("subProcess")),
        )
    }
}

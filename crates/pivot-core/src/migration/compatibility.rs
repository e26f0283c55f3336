//! Which activity types an activity may be migrated to.
//!
//! Activities of the same type are always compatible. Beyond that, the
//! table below lists the pairs of distinct types that share enough runtime
//! state to be exchanged. Event activities are compared by their event type
//! name instead (e.g. `boundaryMessage`), so a message boundary event never
//! becomes a signal boundary event.

use crate::domain::process_definition::{Activity, ActivityType, ProcessDefinition};

/// Pairs of distinct activity types that may be mapped onto each other
const EQUIVALENT_TYPES: &[(ActivityType, ActivityType)] = &[
    (ActivityType::SubProcess, ActivityType::EventSubProcess),
    (ActivityType::EventSubProcess, ActivityType::SubProcess),
];

/// Whether two activity types are compatible
pub fn types_compatible(source: ActivityType, target: ActivityType) -> bool {
    source == target || EQUIVALENT_TYPES.contains(&(source, target))
}

/// Check that `source` may be migrated to `target`, returning the failure message if not
pub fn check(
    source_definition: &ProcessDefinition,
    source: &Activity,
    target_definition: &ProcessDefinition,
    target: &Activity,
) -> Option<String> {
    let source_event = source_definition.event_type_name(source);
    let target_event = target_definition.event_type_name(target);

    if let (Some(source_event), Some(target_event)) = (&source_event, &target_event) {
        return (source_event != target_event).then(|| {
            format!(
                "Events are not of the same type ({} != {})",
                source_event, target_event
            )
        });
    }

    if types_compatible(source.activity_type, target.activity_type) {
        None
    } else {
        Some(format!(
            "Activities have incompatible types ({} is not compatible with {})",
            source.activity_type.behavior_name(),
            target.activity_type.behavior_name()
        ))
    }
}

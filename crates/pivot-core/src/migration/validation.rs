//! Validation of migration instructions against a source and a target
//! process definition.
//!
//! Each rule is a [`MigrationInstructionValidator`]. All rules run for every
//! instruction whose activities exist, so one plan may report several
//! failures on several instructions. The validators only read the two
//! definitions and the instruction list; running them twice on the same
//! input yields the same report.

use crate::domain::process_definition::{Activity, ActivityId, EventKind, ProcessDefinition};
use crate::migration::compatibility;
use crate::migration::instruction::MigrationInstruction;
use crate::migration::report::{
    MigrationInstructionValidationReport, MigrationPlanValidationReport,
    MigrationVariableValidationReport,
};
use crate::types::TypedValue;
use std::collections::BTreeMap;
use tracing::debug;

/// An instruction whose source and target activities both exist
#[derive(Debug, Clone, Copy)]
pub struct ValidatingInstruction<'a> {
    /// Position in the plan
    pub index: usize,
    /// The instruction
    pub instruction: &'a MigrationInstruction,
    /// Source activity
    pub source: &'a Activity,
    /// Target activity
    pub target: &'a Activity,
}

/// Both definitions plus every instruction that passed the existence check
#[derive(Debug)]
pub struct ValidationContext<'a> {
    /// Source definition
    pub source: &'a ProcessDefinition,
    /// Target definition
    pub target: &'a ProcessDefinition,
    instructions: Vec<ValidatingInstruction<'a>>,
}

impl<'a> ValidationContext<'a> {
    /// Instructions with existing activities, in plan order
    pub fn instructions(&self) -> &[ValidatingInstruction<'a>] {
        &self.instructions
    }

    /// Instructions mapping the given source activity
    pub fn by_source(&self, id: &ActivityId) -> Vec<&ValidatingInstruction<'a>> {
        self.instructions
            .iter()
            .filter(|i| i.source.id == *id)
            .collect()
    }

    /// Instructions mapping onto the given target activity
    pub fn by_target(&self, id: &ActivityId) -> Vec<&ValidatingInstruction<'a>> {
        self.instructions
            .iter()
            .filter(|i| i.target.id == *id)
            .collect()
    }

    /// Target of the first instruction for a source activity; the roots map implicitly
    pub fn image_of(&self, id: &ActivityId) -> Option<&'a ActivityId> {
        if *id == self.source.root {
            return Some(&self.target.root);
        }
        self.instructions
            .iter()
            .find(|i| i.source.id == *id)
            .map(|i| &i.target.id)
    }

    /// Whether a source activity is mapped (the root always is)
    pub fn is_source_mapped(&self, id: &ActivityId) -> bool {
        self.image_of(id).is_some()
    }

    /// Whether a target activity is mapped onto (the root always is)
    pub fn is_target_mapped(&self, id: &ActivityId) -> bool {
        *id == self.target.root || self.instructions.iter().any(|i| i.target.id == *id)
    }
}

/// A single validation rule
pub trait MigrationInstructionValidator: Send + Sync {
    /// Append the failures of `instruction` to `failures`
    fn validate(
        &self,
        instruction: &ValidatingInstruction<'_>,
        context: &ValidationContext<'_>,
        failures: &mut Vec<String>,
    );
}

/// Each source activity may be mapped only once
pub struct OnlyOnceMappedActivityValidator;

impl MigrationInstructionValidator for OnlyOnceMappedActivityValidator {
    fn validate(
        &self,
        instruction: &ValidatingInstruction<'_>,
        context: &ValidationContext<'_>,
        failures: &mut Vec<String>,
    ) {
        if context.by_source(&instruction.source.id).len() > 1 {
            failures.push(format!(
                "There are multiple mappings for source activity id '{}'",
                instruction.source.id
            ));
        }
    }
}

/// Source and target must have compatible types
pub struct SameTypeValidator;

impl MigrationInstructionValidator for SameTypeValidator {
    fn validate(
        &self,
        instruction: &ValidatingInstruction<'_>,
        context: &ValidationContext<'_>,
        failures: &mut Vec<String>,
    ) {
        if let Some(failure) = compatibility::check(
            context.source,
            instruction.source,
            context.target,
            instruction.target,
        ) {
            failures.push(failure);
        }
    }
}

/// The closest mapped ancestor of the source activity must be mapped to a
/// strict ancestor of the target activity
pub struct ClosestMappedAncestorValidator;

impl MigrationInstructionValidator for ClosestMappedAncestorValidator {
    fn validate(
        &self,
        instruction: &ValidatingInstruction<'_>,
        context: &ValidationContext<'_>,
        failures: &mut Vec<String>,
    ) {
        let closest = context
            .source
            .ancestors(&instruction.source.id)
            .into_iter()
            .find_map(|ancestor| context.image_of(ancestor).map(|image| (ancestor, image)));

        if let Some((ancestor, image)) = closest {
            if !context.target.is_ancestor(image, &instruction.target.id) {
                failures.push(format!(
                    "The closest mapped ancestor '{}' is mapped to scope '{}' which is not an ancestor of target scope '{}'",
                    ancestor, image, instruction.target.id
                ));
            }
        }
    }
}

/// Events attached to another scope must keep that scope: the source
/// event scope has to be mapped onto the target event scope
pub struct EventScopeValidator;

impl MigrationInstructionValidator for EventScopeValidator {
    fn validate(
        &self,
        instruction: &ValidatingInstruction<'_>,
        context: &ValidationContext<'_>,
        failures: &mut Vec<String>,
    ) {
        if instruction.source.is_compensation_boundary() {
            return;
        }
        let Some(source_scope) = context.source.event_scope(&instruction.source.id) else {
            return;
        };
        if *source_scope == instruction.source.id {
            return;
        }

        let target_scope = context.target.event_scope(&instruction.target.id);
        if context.image_of(source_scope) != target_scope {
            failures.push(format!(
                "The source activity's event scope ({}) must be mapped to the target activity's event scope ({})",
                source_scope,
                target_scope.map(ActivityId::as_str).unwrap_or("none")
            ));
        }
    }
}

/// Event triggers can only be updated on activities that define a persistent one,
/// and conditional events must always be updated
pub struct UpdateEventTriggerValidator;

impl MigrationInstructionValidator for UpdateEventTriggerValidator {
    fn validate(
        &self,
        instruction: &ValidatingInstruction<'_>,
        _context: &ValidationContext<'_>,
        failures: &mut Vec<String>,
    ) {
        let source = instruction.source;
        if instruction.instruction.update_event_trigger && !source.has_persistent_event_trigger() {
            failures.push(
                "Cannot update event trigger because the activity does not define a persistent event trigger"
                    .to_string(),
            );
        }
        if source.event_kind() == Some(EventKind::Conditional)
            && !instruction.instruction.update_event_trigger
        {
            failures.push("Conditional event has to migrate with update event trigger.".to_string());
        }
    }
}

/// Multi-instance bodies and their inner activities move together
pub struct MultiInstanceValidator;

impl MigrationInstructionValidator for MultiInstanceValidator {
    fn validate(
        &self,
        instruction: &ValidatingInstruction<'_>,
        context: &ValidationContext<'_>,
        failures: &mut Vec<String>,
    ) {
        if instruction.source.is_multi_instance_body() {
            let inner_mapped = context
                .source
                .inner_activity(&instruction.source.id)
                .map(|inner| context.is_source_mapped(&inner.id))
                .unwrap_or(false);
            if !inner_mapped {
                failures.push(
                    "Cannot remove the inner activity of a multi-instance body when the body is mapped"
                        .to_string(),
                );
            }
        }

        if instruction.target.is_multi_instance_body() {
            let inner_mapped = context
                .target
                .inner_activity(&instruction.target.id)
                .map(|inner| context.is_target_mapped(&inner.id))
                .unwrap_or(false);
            if !inner_mapped {
                failures.push(
                    "Must map the inner activity of a multi-instance body when the body is mapped"
                        .to_string(),
                );
            }
        }

        for ancestor in context.target.ancestors(&instruction.target.id) {
            let is_body = context
                .target
                .activity(ancestor)
                .map(Activity::is_multi_instance_body)
                .unwrap_or(false);
            if is_body && !context.is_target_mapped(ancestor) {
                failures.push(format!(
                    "Target activity '{}' is a descendant of multi-instance body '{}' that is not mapped from the source process definition.",
                    instruction.target.id, ancestor
                ));
            }
        }
    }
}

/// Joining gateways must not receive more tokens than they can join
pub struct GatewayValidator;

impl MigrationInstructionValidator for GatewayValidator {
    fn validate(
        &self,
        instruction: &ValidatingInstruction<'_>,
        context: &ValidationContext<'_>,
        failures: &mut Vec<String>,
    ) {
        let (source, target) = (instruction.source, instruction.target);
        if !source.activity_type.is_joining_gateway() || !target.activity_type.is_joining_gateway() {
            return;
        }

        if target.incoming_flows < source.incoming_flows {
            failures.push(
                "The target gateway must have at least the same number of incoming sequence flows that the source gateway has"
                    .to_string(),
            );
        }

        if let Some(flow_scope) = context.source.flow_scope(&source.id) {
            if !context.is_source_mapped(flow_scope) {
                failures.push(format!("The gateway's flow scope '{}' must be mapped", flow_scope));
            }
        }

        let gateways_onto_target = context
            .by_target(&target.id)
            .into_iter()
            .filter(|i| i.source.activity_type.is_joining_gateway())
            .count();
        if gateways_onto_target > 1 {
            failures.push(format!(
                "Only one gateway can be mapped to gateway '{}'",
                target.id
            ));
        }
    }
}

/// Runs every instruction rule plus the variable checks
pub struct MigrationPlanValidator {
    validators: Vec<Box<dyn MigrationInstructionValidator>>,
}

impl Default for MigrationPlanValidator {
    fn default() -> Self {
        Self {
            validators: vec![
                Box::new(OnlyOnceMappedActivityValidator),
                Box::new(SameTypeValidator),
                Box::new(EventScopeValidator),
                Box::new(ClosestMappedAncestorValidator),
                Box::new(UpdateEventTriggerValidator),
                Box::new(MultiInstanceValidator),
                Box::new(GatewayValidator),
            ],
        }
    }
}

impl MigrationPlanValidator {
    /// Create a validator with the default rules
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a rule
    pub fn with_validator(mut self, validator: Box<dyn MigrationInstructionValidator>) -> Self {
        self.validators.push(validator);
        self
    }

    /// Validate instructions and plan variables
    pub fn validate(
        &self,
        source: &ProcessDefinition,
        target: &ProcessDefinition,
        instructions: &[MigrationInstruction],
        variables: &BTreeMap<String, TypedValue>,
    ) -> MigrationPlanValidationReport {
        let mut report = MigrationPlanValidationReport::new(source.id.clone(), target.id.clone());
        let mut failures_by_index: Vec<Vec<String>> = vec![Vec::new(); instructions.len()];
        let mut existing = Vec::new();

        for (index, instruction) in instructions.iter().enumerate() {
            let failures = &mut failures_by_index[index];
            let source_activity = existence(
                source,
                &instruction.source_activity_id,
                "Source",
                failures,
            );
            let target_activity = existence(
                target,
                &instruction.target_activity_id,
                "Target",
                failures,
            );
            if let (Some(source_activity), Some(target_activity)) = (source_activity, target_activity)
            {
                existing.push(ValidatingInstruction {
                    index,
                    instruction,
                    source: source_activity,
                    target: target_activity,
                });
            }
        }

        let context = ValidationContext {
            source,
            target,
            instructions: existing,
        };
        for instruction in context.instructions() {
            for validator in &self.validators {
                validator.validate(instruction, &context, &mut failures_by_index[instruction.index]);
            }
        }

        for (instruction, failures) in instructions.iter().zip(failures_by_index) {
            if !failures.is_empty() {
                report
                    .instruction_reports
                    .push(MigrationInstructionValidationReport {
                        instruction: instruction.clone(),
                        failures,
                    });
            }
        }

        for name in variables.keys() {
            if name.trim().is_empty() {
                report.variable_reports.push(MigrationVariableValidationReport {
                    variable_name: name.clone(),
                    failures: vec!["Variable name must not be empty".to_string()],
                });
            }
        }

        debug!(
            source_process_definition_id = %source.id,
            target_process_definition_id = %target.id,
            instructions = instructions.len(),
            failing_instructions = report.instruction_reports.len(),
            "Validated migration instructions"
        );
        report
    }
}

fn existence<'a>(
    definition: &'a ProcessDefinition,
    id: &ActivityId,
    side: &str,
    failures: &mut Vec<String>,
) -> Option<&'a Activity> {
    if id.as_str().is_empty() {
        failures.push(format!("{} activity id is null", side));
        return None;
    }
    let activity = definition.mappable_activity(id);
    if activity.is_none() {
        failures.push(format!("{} activity '{}' does not exist", side, id));
    }
    activity
}

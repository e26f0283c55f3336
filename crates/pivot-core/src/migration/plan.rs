//! Migration plans and their builder.
//!
//! A [`MigrationPlan`] only exists after every instruction passed
//! validation; [`MigrationPlanBuilder::build`] either returns a plan or the
//! complete report of failing instructions.

use crate::domain::process_definition::{
    Activity, ActivityId, ActivityType, EventKind, ProcessDefinition, ProcessDefinitionId,
};
use crate::migration::compatibility;
use crate::migration::error::MigrationError;
use crate::migration::instruction::MigrationInstruction;
use crate::migration::validation::MigrationPlanValidator;
use crate::types::TypedValue;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

/// A validated mapping between two process definitions
#[derive(Debug, Clone)]
pub struct MigrationPlan {
    source: Arc<ProcessDefinition>,
    target: Arc<ProcessDefinition>,
    instructions: Vec<MigrationInstruction>,
    variables: BTreeMap<String, TypedValue>,
}

impl MigrationPlan {
    /// Start building a plan between two definitions
    pub fn builder(
        source: Arc<ProcessDefinition>,
        target: Arc<ProcessDefinition>,
    ) -> MigrationPlanBuilder {
        MigrationPlanBuilder::new(source, target)
    }

    /// Source definition id
    pub fn source_process_definition_id(&self) -> &ProcessDefinitionId {
        &self.source.id
    }

    /// Target definition id
    pub fn target_process_definition_id(&self) -> &ProcessDefinitionId {
        &self.target.id
    }

    /// Source definition
    pub fn source(&self) -> &ProcessDefinition {
        &self.source
    }

    /// Target definition
    pub fn target(&self) -> &ProcessDefinition {
        &self.target
    }

    /// Instructions in plan order
    pub fn instructions(&self) -> &[MigrationInstruction] {
        &self.instructions
    }

    /// Variables written to the process instance after migration
    pub fn variables(&self) -> &BTreeMap<String, TypedValue> {
        &self.variables
    }

    /// Instruction for a source activity
    pub fn instruction_for(&self, source_activity: &ActivityId) -> Option<&MigrationInstruction> {
        self.instructions
            .iter()
            .find(|i| i.source_activity_id == *source_activity)
    }

    /// Target of a source activity; the roots map onto each other implicitly
    pub fn target_of(&self, source_activity: &ActivityId) -> Option<&ActivityId> {
        if *source_activity == self.source.root {
            return Some(&self.target.root);
        }
        self.instruction_for(source_activity)
            .map(|i| &i.target_activity_id)
    }

    /// Whether some instruction maps onto `target_activity`
    pub fn is_target_of_instruction(&self, target_activity: &ActivityId) -> bool {
        self.instructions
            .iter()
            .any(|i| i.target_activity_id == *target_activity)
    }
}

/// Collects instructions and variables, then validates them on `build`
#[derive(Debug, Clone)]
pub struct MigrationPlanBuilder {
    source: Arc<ProcessDefinition>,
    target: Arc<ProcessDefinition>,
    instructions: Vec<MigrationInstruction>,
    variables: BTreeMap<String, TypedValue>,
}

impl MigrationPlanBuilder {
    /// Create an empty builder
    pub fn new(source: Arc<ProcessDefinition>, target: Arc<ProcessDefinition>) -> Self {
        Self {
            source,
            target,
            instructions: Vec::new(),
            variables: BTreeMap::new(),
        }
    }

    /// Map a source activity onto a target activity
    pub fn map_activities(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.instructions
            .push(MigrationInstruction::new(
                ActivityId(source.into()),
                ActivityId(target.into()),
            ));
        self
    }

    /// Add a prepared instruction
    pub fn instruction(mut self, instruction: MigrationInstruction) -> Self {
        self.instructions.push(instruction);
        self
    }

    /// Recompute the event trigger of the most recently added instruction
    pub fn update_event_trigger(mut self) -> Self {
        match self.instructions.last_mut() {
            Some(last) => last.update_event_trigger = true,
            None => warn!("update_event_trigger called before any instruction was added"),
        }
        self
    }

    /// Recompute event triggers for every instruction whose source defines a persistent one
    pub fn update_event_triggers(mut self) -> Self {
        for instruction in self.instructions.iter_mut() {
            let persistent = self
                .source
                .activity(&instruction.source_activity_id)
                .map(Activity::has_persistent_event_trigger)
                .unwrap_or(false);
            if persistent {
                instruction.update_event_trigger = true;
            }
        }
        self
    }

    /// Generate instructions for every activity that exists in both
    /// definitions with the same id, the same flow scope and a compatible type.
    ///
    /// Generated instructions that would not validate are dropped, so the
    /// result never makes `build` fail on its own. Conditional events are
    /// generated with their trigger update enabled.
    pub fn map_equal_activities(mut self) -> Self {
        let mut generated = Vec::new();
        self.generate_equal(&self.source.root, &self.target.root, &mut generated);

        let already: HashSet<ActivityId> = self
            .instructions
            .iter()
            .map(|i| i.source_activity_id.clone())
            .collect();
        generated.retain(|i| !already.contains(&i.source_activity_id));

        let validator = MigrationPlanValidator::new();
        loop {
            let report = validator.validate(
                &self.source,
                &self.target,
                &generated,
                &BTreeMap::new(),
            );
            let failing: HashSet<ActivityId> = report
                .instruction_reports
                .iter()
                .map(|r| r.instruction.source_activity_id.clone())
                .collect();
            if failing.is_empty() {
                break;
            }
            generated.retain(|i| !failing.contains(&i.source_activity_id));
        }

        debug!(
            source_process_definition_id = %self.source.id,
            target_process_definition_id = %self.target.id,
            generated = generated.len(),
            "Generated equal-activity instructions"
        );
        self.instructions.extend(generated);
        self
    }

    fn generate_equal(
        &self,
        source_scope: &ActivityId,
        target_scope: &ActivityId,
        generated: &mut Vec<MigrationInstruction>,
    ) {
        let Some(scope) = self.source.activity(source_scope) else {
            return;
        };
        for child_id in &scope.children {
            let (Some(source), Some(target)) = (
                self.source.activity(child_id),
                self.target.mappable_activity(child_id),
            ) else {
                continue;
            };
            if target.parent.as_ref() != Some(target_scope)
                || !is_migratable(source)
                || compatibility::check(&self.source, source, &self.target, target).is_some()
            {
                continue;
            }

            let mut instruction = MigrationInstruction::new(source.id.clone(), target.id.clone());
            if source.event_kind() == Some(EventKind::Conditional) {
                instruction.update_event_trigger = true;
            }
            generated.push(instruction);

            if source.activity_type.is_container() {
                self.generate_equal(&source.id, &target.id, generated);
            }
        }
    }

    /// Set a variable written to the root of every migrated instance
    pub fn set_variable(mut self, name: impl Into<String>, value: impl Into<TypedValue>) -> Self {
        self.variables.insert(name.into(), value.into());
        self
    }

    /// Set several variables
    pub fn set_variables(
        mut self,
        variables: impl IntoIterator<Item = (String, TypedValue)>,
    ) -> Self {
        self.variables.extend(variables);
        self
    }

    /// Instructions collected so far
    pub fn instructions(&self) -> &[MigrationInstruction] {
        &self.instructions
    }

    /// Validate and build the plan
    pub fn build(self) -> Result<MigrationPlan, MigrationError> {
        let report = MigrationPlanValidator::new().validate(
            &self.source,
            &self.target,
            &self.instructions,
            &self.variables,
        );
        if report.has_failures() {
            warn!(
                source_process_definition_id = %self.source.id,
                target_process_definition_id = %self.target.id,
                failing_instructions = report.instruction_reports.len(),
                "Migration plan is not valid"
            );
            return Err(MigrationError::InvalidPlan(report));
        }

        Ok(MigrationPlan {
            source: self.source,
            target: self.target,
            instructions: self.instructions,
            variables: self.variables,
        })
    }
}

/// Activities that never hold runtime state worth migrating
fn is_migratable(activity: &Activity) -> bool {
    match activity.activity_type {
        ActivityType::StartEvent => activity.event_definition.is_some(),
        ActivityType::EndEvent => false,
        ActivityType::IntermediateThrowEvent => {
            activity.event_kind() != Some(EventKind::Compensation)
        }
        _ => true,
    }
}

//! Status accumulator (spec.md §4.2, Design Notes §9): a per-reconciliation
//! builder that batches field, annotation and condition updates so a single
//! tick emits one combined write instead of many racy partial ones.
//!
//! The source implementation navigates a dynamic map with generic
//! `SetField`/`DeleteField` string-path operations. In a typed client the
//! equivalent is a set of typed setters over the concrete status struct plus
//! a small untyped escape hatch for annotations (which are always
//! `BTreeMap<String, String>` regardless of resource type).

use std::collections::BTreeMap;

use chrono::{DateTime, FixedOffset, Utc};
use kube::{
    Api,
    api::{Patch, PatchParams, PostParams},
};
use serde_json::json;

use crate::{
    labels::FIELD_MANAGER,
    resources::{
        AgenticSession, AgenticSessionCondition, AgenticSessionStatus, Phase, ReconciledRepo,
        ReconciledWorkflow,
    },
    utils::upsert_condition,
};

use super::super::reconcile_error::ReconcileError;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    fn as_str(self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }
}

pub struct StatusPatch {
    status: AgenticSessionStatus,
    generation: i64,
    annotation_sets: BTreeMap<String, String>,
    annotation_deletes: Vec<String>,
    spec_interactive_override: Option<bool>,
    status_dirty: bool,
}

impl StatusPatch {
    pub fn new(current_status: AgenticSessionStatus, generation: i64) -> Self {
        Self {
            status: current_status,
            generation,
            annotation_sets: BTreeMap::new(),
            annotation_deletes: Vec::new(),
            spec_interactive_override: None,
            status_dirty: false,
        }
    }

    pub fn status(&self) -> &AgenticSessionStatus {
        &self.status
    }

    pub fn set_phase(&mut self, phase: Phase) -> &mut Self {
        if self.status.phase.as_ref() != Some(&phase) {
            self.status.phase = Some(phase);
            self.status_dirty = true;
        }
        self
    }

    pub fn set_observed_generation(&mut self, generation: i64) -> &mut Self {
        if self.status.observed_generation != Some(generation) {
            self.status.observed_generation = Some(generation);
            self.status_dirty = true;
        }
        self
    }

    pub fn set_start_time(&mut self, time: DateTime<FixedOffset>) -> &mut Self {
        self.status.start_time = Some(time);
        self.status_dirty = true;
        self
    }

    pub fn set_completion_time(&mut self, time: DateTime<FixedOffset>) -> &mut Self {
        self.status.completion_time = Some(time);
        self.status_dirty = true;
        self
    }

    pub fn clear_completion_time(&mut self) -> &mut Self {
        if self.status.completion_time.is_some() {
            self.status.completion_time = None;
            self.status_dirty = true;
        }
        self
    }

    pub fn set_reconciled_repos(&mut self, repos: Vec<ReconciledRepo>) -> &mut Self {
        self.status.reconciled_repos = repos;
        self.status_dirty = true;
        self
    }

    pub fn set_reconciled_workflow(&mut self, workflow: ReconciledWorkflow) -> &mut Self {
        self.status.reconciled_workflow = Some(workflow);
        self.status_dirty = true;
        self
    }

    pub fn delete_field_reconciled_workflow(&mut self) -> &mut Self {
        if self.status.reconciled_workflow.is_some() {
            self.status.reconciled_workflow = None;
            self.status_dirty = true;
        }
        self
    }

    pub fn add_condition(
        &mut self,
        type_: &str,
        status: ConditionStatus,
        reason: Option<&str>,
        message: Option<&str>,
    ) -> &mut Self {
        let condition = AgenticSessionCondition {
            type_: type_.to_string(),
            status: status.as_str().to_string(),
            reason: reason.map(str::to_string),
            message: message.map(str::to_string),
            last_transition_time: Some(now()),
            observed_generation: Some(self.generation),
        };

        if upsert_condition(&mut self.status.conditions, condition) {
            self.status_dirty = true;
        }

        self
    }

    pub fn set_annotation(&mut self, key: &str, value: impl Into<String>) -> &mut Self {
        self.annotation_sets.insert(key.to_string(), value.into());
        self
    }

    pub fn delete_annotation(&mut self, key: &str) -> &mut Self {
        self.annotation_deletes.push(key.to_string());
        self
    }

    pub fn set_spec_interactive(&mut self, value: bool) -> &mut Self {
        self.spec_interactive_override = Some(value);
        self
    }

    fn has_annotation_changes(&self) -> bool {
        !self.annotation_sets.is_empty() || !self.annotation_deletes.is_empty()
    }

    /// Applies the accumulated operations against `object` (assumed to be
    /// the freshest read available) with a single metadata/spec merge patch
    /// followed, if needed, by a single status subresource write.
    pub async fn apply(
        self,
        api: &Api<AgenticSession>,
        object: &AgenticSession,
    ) -> Result<(), ReconcileError> {
        let name = object
            .metadata
            .name
            .as_deref()
            .ok_or(ReconcileError::PreconditionFailed("expected a name"))?;

        if self.has_annotation_changes() || self.spec_interactive_override.is_some() {
            let mut annotations_patch = serde_json::Map::new();
            for (key, value) in &self.annotation_sets {
                annotations_patch.insert(key.clone(), json!(value));
            }
            for key in &self.annotation_deletes {
                annotations_patch.insert(key.clone(), serde_json::Value::Null);
            }

            let mut merge = json!({ "metadata": { "annotations": annotations_patch } });
            if let Some(interactive) = self.spec_interactive_override {
                merge["spec"] = json!({ "interactive": interactive });
            }

            api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&merge))
                .await?;
        }

        if self.status_dirty {
            let mut patch_object = object.clone();
            patch_object.status = Some(self.status);

            let data = serde_json::to_vec(&patch_object)?;
            api.replace_status(name, &PostParams::default(), data)
                .await?;
        }

        Ok(())
    }
}

fn now() -> DateTime<FixedOffset> {
    Utc::now().fixed_offset()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_phase_is_idempotent_when_unchanged() {
        let mut patch = StatusPatch::new(
            AgenticSessionStatus {
                phase: Some(Phase::Running),
                ..Default::default()
            },
            1,
        );

        patch.set_phase(Phase::Running);
        assert!(!patch.status_dirty);

        patch.set_phase(Phase::Completed);
        assert!(patch.status_dirty);
    }

    #[test]
    fn add_condition_skips_write_when_unchanged() {
        let mut patch = StatusPatch::new(AgenticSessionStatus::default(), 2);
        patch.add_condition("Ready", ConditionStatus::True, Some("RunnerStarted"), None);
        assert!(patch.status_dirty);

        patch.status_dirty = false;
        patch.add_condition("Ready", ConditionStatus::True, Some("RunnerStarted"), None);
        assert!(!patch.status_dirty);
    }

    #[test]
    fn condition_carries_observed_generation() {
        let mut patch = StatusPatch::new(AgenticSessionStatus::default(), 7);
        patch.add_condition("Ready", ConditionStatus::True, None, None);
        assert_eq!(
            patch.status().conditions[0].observed_generation,
            Some(7)
        );
    }
}

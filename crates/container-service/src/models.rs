// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue messages and persisted records.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::phase::Phase;

/// Position of a launch inside one orchestration run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationLink {
    /// Orchestration definition id.
    pub orchestration_id: i64,
    /// Run correlation: the workflow id of the launch that entered the chain.
    pub run_id: String,
    /// Index into the definition's ordered wrapper ids.
    pub position: usize,
}

/// Request to launch one command wrapper. Consumed by the staging consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    /// Owning project.
    pub project: String,
    /// Command wrapper to launch.
    pub wrapper_id: i64,
    /// Command the wrapper belongs to.
    pub command_id: i64,
    /// Wrapper name, for status messages.
    pub wrapper_name: String,
    /// Runtime input values, resolved again at consume time.
    #[serde(default)]
    pub input_values: HashMap<String, String>,
    /// User the launch runs as.
    pub acting_user: String,
    /// Workflow that tracks this launch.
    pub workflow_id: String,
    /// Set for chain steps enqueued by the orchestration engine.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orchestration: Option<OrchestrationLink>,
}

/// Completion report for one container. Consumed by the finalizing consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalizeRequest {
    /// Container record id.
    pub container_id: String,
    /// Exit code as reported by the backend, if any.
    pub exit_code: Option<String>,
    /// Whether the container completed successfully.
    pub successful: bool,
    /// User acting on the completion.
    pub acting_username: String,
}

/// A container launched by the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerRecord {
    /// Generated id (UUID).
    pub id: String,
    /// Backend type that owns the job ("docker", "kubernetes", "mock").
    pub backend: String,
    /// Backend-native job identifier (container id or pod name).
    pub job_id: String,
    /// Current lifecycle phase.
    pub phase: Phase,
    /// Exit code, once known.
    pub exit_code: Option<String>,
    /// Success flag, once terminal.
    pub successful: Option<bool>,
    /// Owning project.
    pub project: String,
    /// Owning user.
    pub username: String,
    /// Workflow tracking this launch.
    pub workflow_id: String,
    /// Launched wrapper.
    pub wrapper_id: i64,
    /// Command of the launched wrapper.
    pub command_id: i64,
    /// Wrapper name.
    pub wrapper_name: String,
    /// Inputs the launch was resolved with.
    pub input_values: HashMap<String, String>,
    /// Orchestration run linkage, if the launch is a chain step.
    pub orchestration: Option<OrchestrationLink>,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// When `phase` last changed.
    pub phase_changed_at: DateTime<Utc>,
}

impl ContainerRecord {
    /// Build a freshly launched record in [`Phase::Pending`].
    pub fn launched(
        id: String,
        backend: &str,
        job_id: String,
        request: &LaunchRequest,
        orchestration: Option<OrchestrationLink>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id,
            backend: backend.to_string(),
            job_id,
            phase: Phase::Pending,
            exit_code: None,
            successful: None,
            project: request.project.clone(),
            username: request.acting_user.clone(),
            workflow_id: request.workflow_id.clone(),
            wrapper_id: request.wrapper_id,
            command_id: request.command_id,
            wrapper_name: request.wrapper_name.clone(),
            input_values: request.input_values.clone(),
            orchestration,
            created_at: now,
            phase_changed_at: now,
        }
    }

    /// Build the record of a chain step that never got a backend job.
    ///
    /// The record is terminal from the start, with an empty `job_id`, so the
    /// run's history shows the step as attempted and failed.
    pub fn launch_failed(
        id: String,
        backend: &str,
        request: &LaunchRequest,
        orchestration: OrchestrationLink,
    ) -> Self {
        let mut record = Self::launched(id, backend, String::new(), request, Some(orchestration));
        record.phase = Phase::Failed;
        record.successful = Some(false);
        record
    }

    /// Time since the last phase change.
    pub fn staleness(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.phase_changed_at
    }
}

/// Ordered chain of command wrappers.
///
/// Which projects use a chain is not part of the definition: a project's
/// selection is kept by the store and read through
/// [`OrchestrationStore::selected_for_project`](crate::store::OrchestrationStore::selected_for_project).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrchestrationDefinition {
    /// Definition id.
    pub id: i64,
    /// Unique name.
    pub name: String,
    /// Disabled chains are not entered by fresh launches.
    pub enabled: bool,
    /// Stop the run when a step fails.
    pub halt_on_command_failure: bool,
    /// Wrapper ids in execution order. Never empty, no duplicates.
    pub wrapper_ids: Vec<i64>,
}

impl OrchestrationDefinition {
    /// Position of a wrapper in the chain.
    pub fn position_of(&self, wrapper_id: i64) -> Option<usize> {
        self.wrapper_ids.iter().position(|id| *id == wrapper_id)
    }

    /// First wrapper of the chain.
    pub fn first_wrapper(&self) -> Option<i64> {
        self.wrapper_ids.first().copied()
    }

    /// Check the ordering invariants: non-empty, each wrapper at one position.
    pub fn is_well_formed(&self) -> bool {
        if self.wrapper_ids.is_empty() {
            return false;
        }
        let mut seen = std::collections::HashSet::new();
        self.wrapper_ids.iter().all(|id| seen.insert(*id))
    }
}

/// A command wrapper resolved against runtime inputs, ready to launch.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ResolvedCommand {
    /// Resolved wrapper.
    pub wrapper_id: i64,
    /// Container image.
    pub image: String,
    /// Command argv.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
}

/// Identity of a wrapper, used to build chain-step launch requests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrapperSummary {
    /// Wrapper id.
    pub wrapper_id: i64,
    /// Command id.
    pub command_id: i64,
    /// Wrapper name.
    pub wrapper_name: String,
}

/// Workflow status strings written by the service.
pub mod workflow_status {
    /// Launch enqueued, not consumed yet.
    pub const QUEUED: &str = "Queued";
    /// Backend job created.
    pub const CREATED: &str = "Created";
    /// Container finished successfully. Prefix of the terminal success status.
    pub const COMPLETE: &str = "Complete";
    /// Command resolution failed at staging.
    pub const FAILED_RESOLUTION: &str = "Failed (Resolution)";
    /// Backend refused or could not create the job.
    pub const FAILED_BACKEND: &str = "Failed (Backend)";
    /// The launch request could not be enqueued.
    pub const FAILED_QUEUE: &str = "Failed (Queue)";
    /// The chain this launch belongs to no longer resolves.
    pub const FAILED_ORCHESTRATION: &str = "Failed (Orchestration)";

    /// Terminal success status embedding the exit code.
    pub fn complete_with_exit_code(exit_code: Option<&str>) -> String {
        match exit_code {
            Some(code) => format!("{} (exit code {})", COMPLETE, code),
            None => COMPLETE.to_string(),
        }
    }

    /// Terminal failure status embedding the exit code.
    pub fn failed_with_exit_code(exit_code: Option<&str>) -> String {
        match exit_code {
            Some(code) => format!("Failed (exit code {})", code),
            None => "Failed (exit code unknown)".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition(wrapper_ids: Vec<i64>) -> OrchestrationDefinition {
        OrchestrationDefinition {
            id: 1,
            name: "chain".to_string(),
            enabled: true,
            halt_on_command_failure: true,
            wrapper_ids,
        }
    }

    #[test]
    fn test_definition_well_formed() {
        assert!(definition(vec![1, 2, 3]).is_well_formed());
        assert!(!definition(vec![]).is_well_formed());
        assert!(!definition(vec![1, 2, 1]).is_well_formed());
    }

    #[test]
    fn test_definition_positions() {
        let def = definition(vec![10, 20, 30]);
        assert_eq!(def.position_of(20), Some(1));
        assert_eq!(def.position_of(40), None);
        assert_eq!(def.first_wrapper(), Some(10));
    }

    #[test]
    fn test_launch_request_without_link_deserializes() {
        let json = r#"{
            "project": "p1",
            "wrapper_id": 7,
            "command_id": 3,
            "wrapper_name": "dcm2niix",
            "acting_user": "alice",
            "workflow_id": "wf-1"
        }"#;
        let request: LaunchRequest = serde_json::from_str(json).unwrap();
        assert!(request.input_values.is_empty());
        assert!(request.orchestration.is_none());
    }

    #[test]
    fn test_launch_failed_record_is_terminal() {
        let request = LaunchRequest {
            project: "p1".to_string(),
            wrapper_id: 7,
            command_id: 3,
            wrapper_name: "step".to_string(),
            input_values: HashMap::new(),
            acting_user: "alice".to_string(),
            workflow_id: "wf-2".to_string(),
            orchestration: None,
        };
        let link = OrchestrationLink {
            orchestration_id: 1,
            run_id: "wf-1".to_string(),
            position: 1,
        };

        let record = ContainerRecord::launch_failed("c1".to_string(), "mock", &request, link.clone());
        assert_eq!(record.phase, Phase::Failed);
        assert!(record.phase.is_terminal());
        assert_eq!(record.successful, Some(false));
        assert!(record.job_id.is_empty());
        assert_eq!(record.orchestration, Some(link));
    }

    #[test]
    fn test_complete_status_embeds_exit_code() {
        assert_eq!(
            workflow_status::complete_with_exit_code(Some("0")),
            "Complete (exit code 0)"
        );
        assert_eq!(workflow_status::complete_with_exit_code(None), "Complete");
    }

    #[test]
    fn test_failed_status_embeds_exit_code() {
        assert_eq!(
            workflow_status::failed_with_exit_code(Some("137")),
            "Failed (exit code 137)"
        );
        assert_eq!(
            workflow_status::failed_with_exit_code(None),
            "Failed (exit code unknown)"
        );
    }
}

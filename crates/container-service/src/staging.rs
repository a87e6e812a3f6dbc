// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Staging consumer - turns launch requests into backend jobs.
//!
//! The command is resolved at consume time, never at enqueue time, because
//! runtime inputs can depend on project data that changed in between. Every
//! failure ends in a terminal workflow status; nothing is retried here. A
//! chain step that fails here is still handed to the orchestration engine,
//! so the run halts or moves on as if the step had run and failed.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::{Backend, JobHandle, JobSpec};
use crate::collaborators::{
    CommandResolver, Notifier, WorkflowTracker, record_status, send_failure_notice,
};
use crate::models::{
    ContainerRecord, LaunchRequest, OrchestrationLink, ResolvedCommand, workflow_status,
};
use crate::orchestration::OrchestrationEngine;
use crate::queue::MessageHandler;
use crate::store::ContainerStore;

/// Label keys attached to every backend job.
pub mod labels {
    /// Container record id.
    pub const CONTAINER_ID: &str = "container-service/container-id";
    /// Owning project.
    pub const PROJECT: &str = "container-service/project";
    /// Workflow tracking the launch.
    pub const WORKFLOW_ID: &str = "container-service/workflow-id";
}

/// Result of staging one launch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StagingOutcome {
    /// Backend job created and record persisted.
    Launched {
        /// New container record id.
        container_id: String,
    },
    /// The command did not resolve against the inputs.
    ResolutionFailed(String),
    /// The backend refused or could not create the job.
    BackendFailed(String),
    /// Chain selection could not be evaluated.
    OrchestrationFailed(String),
    /// The job was created but its record could not be stored.
    PersistFailed(String),
}

/// Consumer for the staging destination.
pub struct StagingConsumer {
    backend: Arc<dyn Backend>,
    containers: Arc<dyn ContainerStore>,
    engine: Arc<OrchestrationEngine>,
    resolver: Arc<dyn CommandResolver>,
    tracker: Arc<dyn WorkflowTracker>,
    notifier: Arc<dyn Notifier>,
}

impl StagingConsumer {
    /// Create a consumer.
    pub fn new(
        backend: Arc<dyn Backend>,
        containers: Arc<dyn ContainerStore>,
        engine: Arc<OrchestrationEngine>,
        resolver: Arc<dyn CommandResolver>,
        tracker: Arc<dyn WorkflowTracker>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            backend,
            containers,
            engine,
            resolver,
            tracker,
            notifier,
        }
    }

    /// Stage one launch request.
    pub async fn on_staging_request(&self, request: LaunchRequest) -> StagingOutcome {
        let link = match self.engine.entry_link(&request).await {
            Ok(link) => link,
            Err(e) => {
                let message = e.to_string();
                self.fail(&request, workflow_status::FAILED_ORCHESTRATION, &message)
                    .await;
                return StagingOutcome::OrchestrationFailed(message);
            }
        };

        let resolved = match self
            .resolver
            .resolve(request.wrapper_id, &request.input_values)
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                let message = e.to_string();
                if let Some(link) = &link
                    && link.position > 0
                {
                    error!(
                        orchestration_id = link.orchestration_id,
                        run_id = %link.run_id,
                        position = link.position,
                        wrapper_id = request.wrapper_id,
                        error = %message,
                        "Chain step does not resolve"
                    );
                }
                self.fail(&request, workflow_status::FAILED_RESOLUTION, &message)
                    .await;
                self.abandon_step(&request, link, &message).await;
                return StagingOutcome::ResolutionFailed(message);
            }
        };

        let container_id = Uuid::new_v4().to_string();
        let spec = job_spec(&container_id, &request, resolved);

        let handle = match self.backend.create_job(&spec).await {
            Ok(handle) => handle,
            Err(e) => {
                let message = e.to_string();
                self.fail(&request, workflow_status::FAILED_BACKEND, &message)
                    .await;
                self.abandon_step(&request, link, &message).await;
                return StagingOutcome::BackendFailed(message);
            }
        };

        let record = ContainerRecord::launched(
            container_id.clone(),
            self.backend.backend_type(),
            handle.job_id.clone(),
            &request,
            link.clone(),
        );

        if let Err(e) = self.containers.create(&record).await {
            let message = format!("container could not be recorded: {}", e);
            self.discard_job(&handle).await;
            self.fail(&request, workflow_status::FAILED_BACKEND, &message)
                .await;
            self.abandon_step(&request, link, &message).await;
            return StagingOutcome::PersistFailed(message);
        }

        record_status(
            self.tracker.as_ref(),
            &request.workflow_id,
            workflow_status::CREATED,
            Some(&format!("container {}", container_id)),
        )
        .await;

        info!(
            container_id = %container_id,
            job_id = %handle.job_id,
            backend = self.backend.backend_type(),
            workflow_id = %request.workflow_id,
            wrapper = %request.wrapper_name,
            "Container launched"
        );

        StagingOutcome::Launched { container_id }
    }

    async fn fail(&self, request: &LaunchRequest, status: &str, message: &str) {
        warn!(
            workflow_id = %request.workflow_id,
            wrapper_id = request.wrapper_id,
            status = %status,
            error = %message,
            "Launch failed"
        );
        record_status(
            self.tracker.as_ref(),
            &request.workflow_id,
            status,
            Some(message),
        )
        .await;
        send_failure_notice(
            self.notifier.as_ref(),
            &request.acting_user,
            &format!("Launch of {} failed", request.wrapper_name),
            &format!(
                "Workflow {} for project {}: {}",
                request.workflow_id, request.project, message
            ),
        )
        .await;
    }

    /// Hand a chain step that never launched to the engine as a failed step.
    async fn abandon_step(
        &self,
        request: &LaunchRequest,
        link: Option<OrchestrationLink>,
        message: &str,
    ) {
        let Some(link) = link else {
            return;
        };

        let record = ContainerRecord::launch_failed(
            Uuid::new_v4().to_string(),
            self.backend.backend_type(),
            request,
            link,
        );
        if let Err(e) = self.containers.create(&record).await {
            warn!(
                container_id = %record.id,
                workflow_id = %request.workflow_id,
                error = %e,
                "Failed to record chain step that never launched"
            );
        }

        let transition = self.engine.on_step_launch_failed(&record, message).await;
        info!(
            workflow_id = %request.workflow_id,
            transition = ?transition,
            "Chain step failed before launch"
        );
    }

    /// Kill and remove a job that has no record.
    async fn discard_job(&self, handle: &JobHandle) {
        if let Err(e) = self.backend.kill(handle).await {
            warn!(job_id = %handle.job_id, error = %e, "Failed to kill unrecorded job");
        }
        if let Err(e) = self.backend.remove(handle).await {
            warn!(job_id = %handle.job_id, error = %e, "Failed to remove unrecorded job");
        }
    }
}

/// Backend job for a resolved launch.
fn job_spec(container_id: &str, request: &LaunchRequest, resolved: ResolvedCommand) -> JobSpec {
    let labels = HashMap::from([
        (labels::CONTAINER_ID.to_string(), container_id.to_string()),
        (labels::PROJECT.to_string(), request.project.clone()),
        (labels::WORKFLOW_ID.to_string(), request.workflow_id.clone()),
    ]);

    JobSpec {
        name: format!("cs-{}", container_id),
        image: resolved.image,
        command: resolved.command,
        env: resolved.env,
        labels,
    }
}

#[async_trait]
impl MessageHandler for StagingConsumer {
    async fn handle(&self, payload: &[u8]) {
        match serde_json::from_slice::<LaunchRequest>(payload) {
            Ok(request) => {
                self.on_staging_request(request).await;
            }
            Err(e) => {
                error!(error = %e, "Discarding malformed launch request");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_spec_labels_and_name() {
        let request = LaunchRequest {
            project: "p1".to_string(),
            wrapper_id: 1,
            command_id: 2,
            wrapper_name: "w".to_string(),
            input_values: HashMap::new(),
            acting_user: "alice".to_string(),
            workflow_id: "wf-9".to_string(),
            orchestration: None,
        };
        let resolved = ResolvedCommand {
            wrapper_id: 1,
            image: "busybox:latest".to_string(),
            command: vec!["echo".to_string(), "hi".to_string()],
            env: HashMap::new(),
        };

        let spec = job_spec("abc", &request, resolved);
        assert_eq!(spec.name, "cs-abc");
        assert_eq!(spec.image, "busybox:latest");
        assert_eq!(spec.labels[labels::CONTAINER_ID], "abc");
        assert_eq!(spec.labels[labels::PROJECT], "p1");
        assert_eq!(spec.labels[labels::WORKFLOW_ID], "wf-9");
    }
}

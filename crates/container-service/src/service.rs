// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Operations exposed to the surrounding platform.

use std::sync::Arc;

use tracing::{info, warn};

use crate::backend::{Backend, BackendError, JobHandle, LogStream};
use crate::collaborators::{Notifier, WorkflowTracker, record_status, send_failure_notice};
use crate::error::{Error, Result};
use crate::models::{ContainerRecord, FinalizeRequest, LaunchRequest, workflow_status};
use crate::orchestration::{OrchestrationEngine, OrchestrationRunState};
use crate::queue::Publisher;
use crate::store::ContainerStore;

/// Entry point for launches, completion callbacks and operator actions.
#[derive(Clone)]
pub struct ContainerService {
    publisher: Publisher,
    containers: Arc<dyn ContainerStore>,
    backend: Arc<dyn Backend>,
    engine: Arc<OrchestrationEngine>,
    tracker: Arc<dyn WorkflowTracker>,
    notifier: Arc<dyn Notifier>,
}

impl ContainerService {
    /// Create the service facade.
    pub fn new(
        publisher: Publisher,
        containers: Arc<dyn ContainerStore>,
        backend: Arc<dyn Backend>,
        engine: Arc<OrchestrationEngine>,
        tracker: Arc<dyn WorkflowTracker>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            publisher,
            containers,
            backend,
            engine,
            tracker,
            notifier,
        }
    }

    /// Enqueue a fresh launch.
    ///
    /// Chain linkage is never accepted from callers; the staging consumer
    /// decides whether the launch enters the project's selected chain. When
    /// the queue rejects the request the workflow is marked failed and the
    /// user notified before the error is returned.
    pub async fn submit_launch(&self, mut request: LaunchRequest) -> Result<()> {
        request.orchestration = None;

        record_status(
            self.tracker.as_ref(),
            &request.workflow_id,
            workflow_status::QUEUED,
            None,
        )
        .await;

        if let Err(e) = self.publisher.publish_launch(&request).await {
            let message = e.to_string();
            warn!(workflow_id = %request.workflow_id, error = %message, "Launch could not be queued");
            record_status(
                self.tracker.as_ref(),
                &request.workflow_id,
                workflow_status::FAILED_QUEUE,
                Some(&message),
            )
            .await;
            send_failure_notice(
                self.notifier.as_ref(),
                &request.acting_user,
                &format!("Launch of {} failed", request.wrapper_name),
                &format!(
                    "Workflow {} could not be queued: {}",
                    request.workflow_id, message
                ),
            )
            .await;
            return Err(e);
        }

        info!(
            workflow_id = %request.workflow_id,
            project = %request.project,
            wrapper_id = request.wrapper_id,
            "Launch submitted"
        );
        Ok(())
    }

    /// Enqueue a completion report from a backend callback.
    ///
    /// On a queue failure the user is notified; the record stays in flight so
    /// the reconciliation loop finalizes it later.
    pub async fn notify_completion(
        &self,
        container_id: &str,
        exit_code: Option<String>,
        successful: bool,
        username: &str,
    ) -> Result<()> {
        let request = FinalizeRequest {
            container_id: container_id.to_string(),
            exit_code,
            successful,
            acting_username: username.to_string(),
        };

        if let Err(e) = self.publisher.publish_finalize(&request).await {
            warn!(container_id = %container_id, error = %e, "Completion could not be queued");
            send_failure_notice(
                self.notifier.as_ref(),
                username,
                &format!("Completion of container {} not recorded", container_id),
                &format!(
                    "The completion report could not be queued ({}); it will be picked up by status reconciliation",
                    e
                ),
            )
            .await;
            return Err(e);
        }
        Ok(())
    }

    /// Unconsumed messages on a destination. Observability only.
    pub async fn get_queue_depth(&self, destination: &str) -> Result<u64> {
        self.publisher.depth(destination).await
    }

    /// Load a container record.
    pub async fn container(&self, container_id: &str) -> Result<ContainerRecord> {
        self.containers
            .find_by_id(container_id)
            .await?
            .ok_or_else(|| Error::ContainerNotFound(container_id.to_string()))
    }

    /// Records launched for a workflow.
    pub async fn containers_for_workflow(&self, workflow_id: &str) -> Result<Vec<ContainerRecord>> {
        self.containers.find_by_workflow(workflow_id).await
    }

    /// Kill a container. The resulting failed phase is picked up by
    /// reconciliation like any other failure.
    pub async fn kill_container(&self, container_id: &str) -> Result<()> {
        let record = self.container(container_id).await?;
        if record.phase.is_terminal() {
            return Ok(());
        }
        self.backend.kill(&JobHandle::new(&record.job_id)).await?;
        info!(container_id = %container_id, job_id = %record.job_id, "Container killed");
        Ok(())
    }

    /// Stream a container's logs.
    pub async fn container_logs(&self, container_id: &str) -> Result<LogStream> {
        let record = self.container(container_id).await?;
        if record.job_id.is_empty() {
            // Chain step that failed before its job was created.
            return Err(BackendError::JobNotFound(record.id).into());
        }
        Ok(self.backend.fetch_logs(&JobHandle::new(&record.job_id)).await?)
    }

    /// State of an orchestration run.
    pub async fn orchestration_run_state(
        &self,
        orchestration_id: i64,
        run_id: &str,
    ) -> Result<OrchestrationRunState> {
        self.engine.run_state(orchestration_id, run_id).await
    }
}

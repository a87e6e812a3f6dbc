// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Finalizing consumer - terminal bookkeeping for completed containers.
//!
//! Both a direct backend callback and the reconciliation loop can produce a
//! finalize request for the same container, and the queue delivers at least
//! once. The record's terminal transition is a single conditional update;
//! only the caller that applied it touches the workflow, notifies, cleans up
//! and advances the chain.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, JobHandle};
use crate::collaborators::{Notifier, WorkflowTracker, record_status, send_failure_notice};
use crate::models::{ContainerRecord, FinalizeRequest, workflow_status};
use crate::orchestration::{ChainTransition, OrchestrationEngine};
use crate::phase::Phase;
use crate::queue::MessageHandler;
use crate::store::ContainerStore;

/// Result of consuming one finalize request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    /// Terminal transition applied.
    Finalized {
        /// What the orchestration engine did with the completion.
        transition: ChainTransition,
    },
    /// The record was already terminal; nothing was done.
    AlreadyFinal,
    /// No record exists for the container id.
    MissingRecord,
    /// The store failed. The record stays active, so the reconciliation loop
    /// produces another finalize request.
    StoreFailed(String),
}

/// Consumer for the finalizing destination.
pub struct FinalizingConsumer {
    containers: Arc<dyn ContainerStore>,
    backend: Arc<dyn Backend>,
    engine: Arc<OrchestrationEngine>,
    tracker: Arc<dyn WorkflowTracker>,
    notifier: Arc<dyn Notifier>,
    auto_cleanup: bool,
}

impl FinalizingConsumer {
    /// Create a consumer.
    pub fn new(
        containers: Arc<dyn ContainerStore>,
        backend: Arc<dyn Backend>,
        engine: Arc<OrchestrationEngine>,
        tracker: Arc<dyn WorkflowTracker>,
        notifier: Arc<dyn Notifier>,
        auto_cleanup: bool,
    ) -> Self {
        Self {
            containers,
            backend,
            engine,
            tracker,
            notifier,
            auto_cleanup,
        }
    }

    /// Finalize one container.
    pub async fn on_finalize_request(&self, request: FinalizeRequest) -> FinalizeOutcome {
        let record = match self.containers.find_by_id(&request.container_id).await {
            Ok(Some(record)) => record,
            Ok(None) => {
                error!(
                    container_id = %request.container_id,
                    acting_user = %request.acting_username,
                    "Finalize request for unknown container, dropping"
                );
                return FinalizeOutcome::MissingRecord;
            }
            Err(e) => {
                error!(container_id = %request.container_id, error = %e, "Failed to load container");
                return FinalizeOutcome::StoreFailed(e.to_string());
            }
        };

        let phase = Phase::from_outcome(request.successful);
        let exit_code = request.exit_code.as_deref();

        let applied = match self
            .containers
            .complete_if_active(&record.id, phase, exit_code)
            .await
        {
            Ok(applied) => applied,
            Err(e) => {
                error!(container_id = %record.id, error = %e, "Failed to finalize container");
                return FinalizeOutcome::StoreFailed(e.to_string());
            }
        };

        if !applied {
            debug!(container_id = %record.id, "Container already finalized, skipping");
            return FinalizeOutcome::AlreadyFinal;
        }

        info!(
            container_id = %record.id,
            workflow_id = %record.workflow_id,
            phase = %phase,
            exit_code = ?request.exit_code,
            acting_user = %request.acting_username,
            "Container finalized"
        );

        self.update_workflow(&record, &request).await;

        if self.auto_cleanup {
            self.cleanup(&record).await;
        }

        let transition = self
            .engine
            .on_wrapper_completed(&record, request.successful)
            .await;

        FinalizeOutcome::Finalized { transition }
    }

    async fn update_workflow(&self, record: &ContainerRecord, request: &FinalizeRequest) {
        let detail = format!("container {}", record.id);

        if request.successful {
            let status = workflow_status::complete_with_exit_code(request.exit_code.as_deref());
            record_status(
                self.tracker.as_ref(),
                &record.workflow_id,
                &status,
                Some(&detail),
            )
            .await;
            return;
        }

        let status = workflow_status::failed_with_exit_code(request.exit_code.as_deref());
        record_status(
            self.tracker.as_ref(),
            &record.workflow_id,
            &status,
            Some(&detail),
        )
        .await;
        send_failure_notice(
            self.notifier.as_ref(),
            &record.username,
            &format!("{} failed", record.wrapper_name),
            &format!(
                "Container {} of workflow {} in project {} finished with status '{}'",
                record.id, record.workflow_id, record.project, status
            ),
        )
        .await;
    }

    async fn cleanup(&self, record: &ContainerRecord) {
        if record.backend != self.backend.backend_type() {
            warn!(
                container_id = %record.id,
                backend = %record.backend,
                "Container belongs to another backend, not removing"
            );
            return;
        }
        if let Err(e) = self.backend.remove(&JobHandle::new(&record.job_id)).await {
            warn!(container_id = %record.id, job_id = %record.job_id, error = %e, "Failed to remove finished job");
        }
    }
}

#[async_trait]
impl MessageHandler for FinalizingConsumer {
    async fn handle(&self, payload: &[u8]) {
        match serde_json::from_slice::<FinalizeRequest>(payload) {
            Ok(request) => {
                self.on_finalize_request(request).await;
            }
            Err(e) => {
                error!(error = %e, "Discarding malformed finalize request");
            }
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestration engine - ordered command-wrapper chains.
//!
//! A run is one pass through a chain, correlated by the workflow id of the
//! launch that entered it. Runs are independent of each other: run state is
//! never kept per definition, only derived from the container records of the
//! run. The engine is driven by the finalizing consumer, and by the staging
//! consumer for steps that fail before a job exists. Each finished step either
//! enqueues the next step, completes the run, or halts it.
//!
//! ```text
//! NotStarted -> Running(0) -> Running(1) -> ... -> Completed
//!                   |              |
//!                   +--------------+-------------> Halted(position)
//! ```

use std::sync::Arc;

use tracing::{error, info, warn};
use uuid::Uuid;

use crate::collaborators::{
    CommandResolver, Notifier, WorkflowTracker, record_status, send_failure_notice,
};
use crate::error::{Error, Result};
use crate::models::{
    ContainerRecord, LaunchRequest, OrchestrationDefinition, OrchestrationLink, workflow_status,
};
use crate::phase::Phase;
use crate::queue::Publisher;
use crate::store::{ContainerStore, OrchestrationStore};

/// Why a run stopped before its last step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HaltReason {
    /// The step failed and the chain halts on command failure.
    CommandFailed,
    /// The chain references something that no longer resolves.
    Inconsistency(String),
    /// The next step could not be enqueued.
    EnqueueFailed(String),
    /// The step never got a backend job.
    LaunchFailed(String),
    /// A store or resolver call failed while deciding the next step.
    Error(String),
}

/// Outcome of handing a completed step to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainTransition {
    /// The completed container is not part of a chain.
    NotInChain,
    /// The next step was enqueued.
    Advanced {
        /// Position of the enqueued step.
        position: usize,
        /// Fresh workflow id of the enqueued step.
        workflow_id: String,
    },
    /// The last step completed.
    Completed,
    /// The run stopped.
    Halted {
        /// Position the run stopped at.
        position: usize,
        /// Why.
        reason: HaltReason,
    },
}

/// State of one orchestration run, reconstructed from container records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestrationRunState {
    /// No step of the run has been launched.
    NotStarted,
    /// The step at `position` is launched or queued.
    Running {
        /// Current step.
        position: usize,
    },
    /// Every step ran.
    Completed,
    /// The step at `position` failed, or never launched, and the chain halts
    /// on failure.
    Halted {
        /// Failed step.
        position: usize,
    },
}

/// Drives orchestration runs forward.
pub struct OrchestrationEngine {
    orchestrations: Arc<dyn OrchestrationStore>,
    containers: Arc<dyn ContainerStore>,
    resolver: Arc<dyn CommandResolver>,
    tracker: Arc<dyn WorkflowTracker>,
    notifier: Arc<dyn Notifier>,
    publisher: Publisher,
}

impl OrchestrationEngine {
    /// Create an engine.
    pub fn new(
        orchestrations: Arc<dyn OrchestrationStore>,
        containers: Arc<dyn ContainerStore>,
        resolver: Arc<dyn CommandResolver>,
        tracker: Arc<dyn WorkflowTracker>,
        notifier: Arc<dyn Notifier>,
        publisher: Publisher,
    ) -> Self {
        Self {
            orchestrations,
            containers,
            resolver,
            tracker,
            notifier,
            publisher,
        }
    }

    /// Chain linkage for a launch about to be staged.
    ///
    /// Chain steps keep the link they were enqueued with. A fresh launch
    /// enters a new run only when its wrapper is the first wrapper of the
    /// project's selected, enabled orchestration. Orchestrations that are
    /// available but not selected never capture fresh launches.
    pub async fn entry_link(&self, request: &LaunchRequest) -> Result<Option<OrchestrationLink>> {
        if request.orchestration.is_some() {
            return Ok(request.orchestration.clone());
        }

        let Some(definition) = self
            .orchestrations
            .selected_for_project(&request.project)
            .await?
        else {
            return Ok(None);
        };

        if !definition.enabled || definition.first_wrapper() != Some(request.wrapper_id) {
            return Ok(None);
        }

        if !definition.is_well_formed() {
            warn!(
                orchestration_id = definition.id,
                orchestration = %definition.name,
                project = %request.project,
                "Selected orchestration is malformed, launching outside the chain"
            );
            return Ok(None);
        }

        info!(
            orchestration_id = definition.id,
            orchestration = %definition.name,
            run_id = %request.workflow_id,
            "Launch enters orchestration"
        );

        Ok(Some(OrchestrationLink {
            orchestration_id: definition.id,
            run_id: request.workflow_id.clone(),
            position: 0,
        }))
    }

    /// Decide what follows a completed step.
    ///
    /// Called exactly once per container, after its terminal transition was
    /// applied. Never fails: errors halt the run and are reported.
    pub async fn on_wrapper_completed(
        &self,
        record: &ContainerRecord,
        successful: bool,
    ) -> ChainTransition {
        let Some(link) = &record.orchestration else {
            return ChainTransition::NotInChain;
        };

        match self.advance(record, link, successful).await {
            Ok(transition) => transition,
            Err(e) => self.halt_on_error(record, link, e).await,
        }
    }

    /// Decide what follows a chain step that failed before its job existed.
    ///
    /// `record` is the terminal record persisted for the step. The step counts
    /// as a failed step: a halting chain stops here and the halt is reported,
    /// any other chain moves on to the next position.
    pub async fn on_step_launch_failed(
        &self,
        record: &ContainerRecord,
        failure: &str,
    ) -> ChainTransition {
        let Some(link) = &record.orchestration else {
            return ChainTransition::NotInChain;
        };

        match self.advance(record, link, false).await {
            Ok(ChainTransition::Halted {
                position,
                reason: HaltReason::CommandFailed,
            }) => {
                let reason = HaltReason::LaunchFailed(failure.to_string());
                self.report_halt(record, link, &reason).await;
                ChainTransition::Halted { position, reason }
            }
            Ok(transition) => transition,
            Err(e) => self.halt_on_error(record, link, e).await,
        }
    }

    async fn halt_on_error(
        &self,
        record: &ContainerRecord,
        link: &OrchestrationLink,
        e: Error,
    ) -> ChainTransition {
        let reason = match e {
            Error::OrchestrationInconsistency(message) => HaltReason::Inconsistency(message),
            other => HaltReason::Error(other.to_string()),
        };
        self.report_halt(record, link, &reason).await;
        ChainTransition::Halted {
            position: link.position,
            reason,
        }
    }

    async fn advance(
        &self,
        record: &ContainerRecord,
        link: &OrchestrationLink,
        successful: bool,
    ) -> Result<ChainTransition> {
        let definition = self.definition(link.orchestration_id).await?;

        if definition.position_of(record.wrapper_id) != Some(link.position) {
            return Err(Error::OrchestrationInconsistency(format!(
                "wrapper {} is not at position {} of orchestration '{}'",
                record.wrapper_id, link.position, definition.name
            )));
        }

        if !successful && definition.halt_on_command_failure {
            info!(
                orchestration = %definition.name,
                run_id = %link.run_id,
                position = link.position,
                container_id = %record.id,
                "Step failed, halting orchestration run"
            );
            return Ok(ChainTransition::Halted {
                position: link.position,
                reason: HaltReason::CommandFailed,
            });
        }

        let next = link.position + 1;
        let Some(&next_wrapper) = definition.wrapper_ids.get(next) else {
            info!(
                orchestration = %definition.name,
                run_id = %link.run_id,
                steps = definition.wrapper_ids.len(),
                "Orchestration run completed"
            );
            return Ok(ChainTransition::Completed);
        };

        let summary = self.resolver.describe(next_wrapper).await?.ok_or_else(|| {
            Error::OrchestrationInconsistency(format!(
                "wrapper {} at position {} of orchestration '{}' no longer exists",
                next_wrapper, next, definition.name
            ))
        })?;

        let request = LaunchRequest {
            project: record.project.clone(),
            wrapper_id: summary.wrapper_id,
            command_id: summary.command_id,
            wrapper_name: summary.wrapper_name,
            input_values: record.input_values.clone(),
            acting_user: record.username.clone(),
            workflow_id: Uuid::new_v4().to_string(),
            orchestration: Some(OrchestrationLink {
                orchestration_id: definition.id,
                run_id: link.run_id.clone(),
                position: next,
            }),
        };

        let detail = format!(
            "Step {} of {} in orchestration '{}'",
            next + 1,
            definition.wrapper_ids.len(),
            definition.name
        );
        record_status(
            self.tracker.as_ref(),
            &request.workflow_id,
            workflow_status::QUEUED,
            Some(&detail),
        )
        .await;

        if let Err(e) = self.publisher.publish_launch(&request).await {
            let message = e.to_string();
            error!(
                orchestration = %definition.name,
                run_id = %link.run_id,
                position = next,
                error = %message,
                "Failed to enqueue next orchestration step"
            );
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
                &format!("Orchestration '{}' halted", definition.name),
                &format!(
                    "Step {} ({}) could not be queued: {}",
                    next + 1,
                    request.wrapper_name,
                    message
                ),
            )
            .await;
            return Ok(ChainTransition::Halted {
                position: next,
                reason: HaltReason::EnqueueFailed(message),
            });
        }

        info!(
            orchestration = %definition.name,
            run_id = %link.run_id,
            position = next,
            wrapper_id = request.wrapper_id,
            workflow_id = %request.workflow_id,
            "Orchestration advanced"
        );

        Ok(ChainTransition::Advanced {
            position: next,
            workflow_id: request.workflow_id,
        })
    }

    async fn definition(&self, orchestration_id: i64) -> Result<OrchestrationDefinition> {
        self.orchestrations
            .get_orchestration(orchestration_id)
            .await?
            .ok_or_else(|| {
                Error::OrchestrationInconsistency(format!(
                    "orchestration {} no longer exists",
                    orchestration_id
                ))
            })
    }

    async fn report_halt(&self, record: &ContainerRecord, link: &OrchestrationLink, reason: &HaltReason) {
        let message = match reason {
            HaltReason::Inconsistency(m)
            | HaltReason::Error(m)
            | HaltReason::EnqueueFailed(m)
            | HaltReason::LaunchFailed(m) => m.as_str(),
            HaltReason::CommandFailed => "step failed",
        };

        error!(
            orchestration_id = link.orchestration_id,
            run_id = %link.run_id,
            position = link.position,
            container_id = %record.id,
            error = %message,
            "Orchestration run halted"
        );

        send_failure_notice(
            self.notifier.as_ref(),
            &record.username,
            &format!("Orchestration {} halted", link.orchestration_id),
            &format!(
                "The run started by workflow {} stopped after step {} ({}): {}",
                link.run_id,
                link.position + 1,
                record.wrapper_name,
                message
            ),
        )
        .await;
    }

    /// Reconstruct the state of a run from its container records.
    pub async fn run_state(
        &self,
        orchestration_id: i64,
        run_id: &str,
    ) -> Result<OrchestrationRunState> {
        let definition = self.definition(orchestration_id).await?;
        let records = self.containers.find_by_run(orchestration_id, run_id).await?;

        let Some(last) = records.last() else {
            return Ok(OrchestrationRunState::NotStarted);
        };
        let position = last.orchestration.as_ref().map(|l| l.position).unwrap_or(0);

        let state = if !last.phase.is_terminal() {
            OrchestrationRunState::Running { position }
        } else if last.phase == Phase::Failed && definition.halt_on_command_failure {
            OrchestrationRunState::Halted { position }
        } else if position + 1 >= definition.wrapper_ids.len() {
            OrchestrationRunState::Completed
        } else {
            // Next step is queued but not staged yet.
            OrchestrationRunState::Running {
                position: position + 1,
            }
        };

        Ok(state)
    }
}

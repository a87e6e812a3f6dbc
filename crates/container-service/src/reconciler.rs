// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker reconciling container records with backend state.
//!
//! Completion callbacks can be lost. Every cycle, each record in a
//! non-terminal phase is checked against the backend:
//! - terminal native phase: a finalize request is synthesized, exactly as if
//!   the backend had called back
//! - job gone from the backend: finalized as failed
//! - other phase change: persisted (e.g. pending to running)
//! - backend unreachable: skipped, retried with per-record backoff
//!
//! A record whose finalize request is still queued is left alone for a few
//! cycles, then re-enqueued if it is still in flight.
//!
//! There is no give-up limit. Records stuck in flight are reported through
//! their staleness (time since last phase change).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::backend::{Backend, BackendError, JobHandle};
use crate::error::Result;
use crate::models::{ContainerRecord, FinalizeRequest};
use crate::phase::Phase;
use crate::queue::Publisher;
use crate::store::ContainerStore;

/// Cycles to wait before re-enqueueing a finalize request for a record that
/// is still in flight.
const FINALIZE_HOLD_CYCLES: u32 = 3;

/// Configuration for the reconciler.
#[derive(Debug, Clone)]
pub struct ReconcilerConfig {
    /// How often to reconcile.
    pub poll_interval: Duration,
    /// Records without a phase change for this long are reported as stale.
    pub stale_after: Duration,
    /// Upper bound for the per-record retry delay after backend errors.
    pub max_backoff: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            stale_after: Duration::from_secs(3600),
            max_backoff: Duration::from_secs(300),
        }
    }
}

/// What one reconciliation cycle did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconciliationReport {
    /// Records queried against the backend.
    pub checked: usize,
    /// Finalize requests enqueued.
    pub finalized: usize,
    /// Non-terminal phase changes persisted.
    pub phase_updates: usize,
    /// Records whose backend query failed.
    pub unreachable: usize,
    /// Records skipped (backing off, finalize pending, or owned by another
    /// backend).
    pub skipped: usize,
    /// Records in flight for longer than `stale_after`.
    pub stale: usize,
    /// Longest time any in-flight record has gone without a phase change.
    pub max_staleness: Duration,
}

#[derive(Debug, Clone, Copy)]
struct Backoff {
    failures: u32,
    retry_at: Instant,
}

/// Periodic reconciler of container records.
pub struct Reconciler {
    containers: Arc<dyn ContainerStore>,
    backend: Arc<dyn Backend>,
    publisher: Publisher,
    config: ReconcilerConfig,
    // Held for a whole cycle, so cycles never overlap.
    backoff: Mutex<HashMap<String, Backoff>>,
    shutdown: Arc<Notify>,
}

impl Reconciler {
    /// Create a reconciler.
    pub fn new(
        containers: Arc<dyn ContainerStore>,
        backend: Arc<dyn Backend>,
        publisher: Publisher,
        config: ReconcilerConfig,
    ) -> Self {
        Self {
            containers,
            backend,
            publisher,
            config,
            backoff: Mutex::new(HashMap::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconciliation loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            backend = self.backend.backend_type(),
            "Reconciler started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconciler received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    if let Err(e) = self.reconcile_once().await {
                        error!(error = %e, "Reconciliation cycle failed");
                    }
                }
            }
        }

        info!("Reconciler stopped");
    }

    /// Run one reconciliation cycle.
    pub async fn reconcile_once(&self) -> Result<ReconciliationReport> {
        let mut backoff = self.backoff.lock().await;
        let records = self.containers.find_active().await?;

        // Forget backoff state of records that are no longer in flight.
        backoff.retain(|id, _| records.iter().any(|r| &r.id == id));

        let now = Utc::now();
        let mut report = ReconciliationReport::default();

        for record in &records {
            let staleness = record.staleness(now).to_std().unwrap_or_default();
            report.max_staleness = report.max_staleness.max(staleness);
            if staleness > self.config.stale_after {
                report.stale += 1;
                debug!(
                    container_id = %record.id,
                    phase = %record.phase,
                    staleness_secs = staleness.as_secs(),
                    "Container has not changed phase"
                );
            }

            if record.backend != self.backend.backend_type() {
                report.skipped += 1;
                continue;
            }

            if let Some(state) = backoff.get(&record.id)
                && Instant::now() < state.retry_at
            {
                report.skipped += 1;
                continue;
            }

            report.checked += 1;
            match self.check(record).await {
                Ok(CheckOutcome::Finalized) => {
                    report.finalized += 1;
                    // Give the finalizing consumer time before enqueueing again.
                    backoff.insert(
                        record.id.clone(),
                        Backoff {
                            failures: 0,
                            retry_at: Instant::now() + self.finalize_hold(),
                        },
                    );
                }
                Ok(outcome) => {
                    backoff.remove(&record.id);
                    if let CheckOutcome::PhaseUpdated = outcome {
                        report.phase_updates += 1;
                    }
                }
                Err(e) => {
                    report.unreachable += 1;
                    let failures = backoff.get(&record.id).map(|b| b.failures).unwrap_or(0) + 1;
                    let delay = self.retry_delay(failures);
                    backoff.insert(
                        record.id.clone(),
                        Backoff {
                            failures,
                            retry_at: Instant::now() + delay,
                        },
                    );
                    warn!(
                        container_id = %record.id,
                        job_id = %record.job_id,
                        failures = failures,
                        retry_in_secs = delay.as_secs(),
                        error = %e,
                        "Backend status query failed"
                    );
                }
            }
        }

        if report.stale > 0 {
            warn!(
                stale = report.stale,
                max_staleness_secs = report.max_staleness.as_secs(),
                "In-flight containers without a phase change"
            );
        }

        debug!(
            active = records.len(),
            checked = report.checked,
            finalized = report.finalized,
            phase_updates = report.phase_updates,
            unreachable = report.unreachable,
            skipped = report.skipped,
            "Reconciliation cycle finished"
        );

        Ok(report)
    }

    /// How long a record with an enqueued finalize request is left alone.
    fn finalize_hold(&self) -> Duration {
        self.config.poll_interval.saturating_mul(FINALIZE_HOLD_CYCLES)
    }

    /// Delay before the next query after `failures` consecutive errors.
    fn retry_delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
        self.config
            .poll_interval
            .saturating_mul(factor)
            .min(self.config.max_backoff)
    }

    async fn check(&self, record: &ContainerRecord) -> std::result::Result<CheckOutcome, String> {
        let handle = JobHandle::new(&record.job_id);

        let status = match self.backend.get_status(&handle).await {
            Ok(status) => status,
            Err(BackendError::JobNotFound(_)) => {
                warn!(
                    container_id = %record.id,
                    job_id = %record.job_id,
                    "Backend job disappeared, finalizing as failed"
                );
                return self.finalize(record, false, None).await;
            }
            Err(e) => return Err(e.to_string()),
        };

        let phase = self.backend.vocabulary().map(&status.phase);

        if phase.is_terminal() {
            info!(
                container_id = %record.id,
                native_phase = %status.phase,
                exit_code = ?status.exit_code,
                message = ?status.message,
                "Detected terminal phase without completion notice"
            );
            return self
                .finalize(
                    record,
                    phase.is_successful(),
                    status.exit_code.map(|c| c.to_string()),
                )
                .await;
        }

        if phase == Phase::Unknown {
            debug!(
                container_id = %record.id,
                native_phase = %status.phase,
                "Unrecognized native phase, leaving record unchanged"
            );
            return Ok(CheckOutcome::Unchanged);
        }

        if phase != record.phase {
            let updated = self
                .containers
                .update_phase(&record.id, phase)
                .await
                .map_err(|e| e.to_string())?;
            if updated {
                debug!(container_id = %record.id, from = %record.phase, to = %phase, "Phase changed");
                return Ok(CheckOutcome::PhaseUpdated);
            }
        }

        Ok(CheckOutcome::Unchanged)
    }

    async fn finalize(
        &self,
        record: &ContainerRecord,
        successful: bool,
        exit_code: Option<String>,
    ) -> std::result::Result<CheckOutcome, String> {
        let request = FinalizeRequest {
            container_id: record.id.clone(),
            exit_code,
            successful,
            acting_username: record.username.clone(),
        };
        self.publisher
            .publish_finalize(&request)
            .await
            .map_err(|e| format!("could not enqueue finalize request: {}", e))?;
        Ok(CheckOutcome::Finalized)
    }
}

enum CheckOutcome {
    Finalized,
    PhaseUpdated,
    Unchanged,
}

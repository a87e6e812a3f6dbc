// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock backend for testing.
//!
//! Simulates jobs in memory. Jobs stay `Running` until a test completes them,
//! which makes lost-callback scenarios easy to reproduce.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream;
use tokio::sync::Mutex;

use super::traits::*;
use crate::phase::{KUBERNETES_PHASES, PhaseVocabulary};

/// Mock job state.
#[derive(Debug, Clone)]
struct MockJob {
    spec: JobSpec,
    status: NativeStatus,
    removed: bool,
}

/// Mock backend for testing.
#[derive(Default)]
pub struct MockBackend {
    jobs: Mutex<HashMap<String, MockJob>>,
    next_id: AtomicU64,
    reject_creates: AtomicBool,
    unreachable: AtomicBool,
}

impl MockBackend {
    /// Create a new mock backend.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `create_job` fail with `Rejected`.
    pub fn set_reject_creates(&self, reject: bool) {
        self.reject_creates.store(reject, Ordering::SeqCst);
    }

    /// Make every subsequent call fail as if the backend were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Finish a job with an exit code. Zero succeeds, anything else fails.
    pub async fn complete(&self, job_id: &str, exit_code: i64) {
        let phase = if exit_code == 0 { "Succeeded" } else { "Failed" };
        self.set_status(
            job_id,
            NativeStatus {
                phase: phase.to_string(),
                exit_code: Some(exit_code),
                message: None,
            },
        )
        .await;
    }

    /// Overwrite a job's native status.
    pub async fn set_status(&self, job_id: &str, status: NativeStatus) {
        let mut jobs = self.jobs.lock().await;
        if let Some(job) = jobs.get_mut(job_id) {
            job.status = status;
        }
    }

    /// Drop a job as if it had been deleted out-of-band.
    pub async fn forget(&self, job_id: &str) {
        self.jobs.lock().await.remove(job_id);
    }

    /// Specs of every job created so far, in creation order.
    pub async fn created_jobs(&self) -> Vec<JobSpec> {
        let jobs = self.jobs.lock().await;
        let mut created: Vec<(u64, JobSpec)> = jobs
            .iter()
            .filter_map(|(id, job)| {
                id.strip_prefix("mock-")
                    .and_then(|n| n.parse().ok())
                    .map(|n| (n, job.spec.clone()))
            })
            .collect();
        created.sort_by_key(|(n, _)| *n);
        created.into_iter().map(|(_, spec)| spec).collect()
    }

    /// Number of jobs created so far (including forgotten ones).
    pub fn created_count(&self) -> u64 {
        self.next_id.load(Ordering::SeqCst)
    }

    /// Whether `remove` was called for a job.
    pub async fn is_removed(&self, job_id: &str) -> bool {
        self.jobs
            .lock()
            .await
            .get(job_id)
            .map(|job| job.removed)
            .unwrap_or(false)
    }

    fn check_reachable(&self) -> Result<()> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::Unreachable("mock backend is down".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn backend_type(&self) -> &'static str {
        "mock"
    }

    fn vocabulary(&self) -> &'static PhaseVocabulary {
        &KUBERNETES_PHASES
    }

    async fn create_job(&self, spec: &JobSpec) -> Result<JobHandle> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BackendError::NoBackendAvailable(
                "mock backend is down".into(),
            ));
        }
        if self.reject_creates.load(Ordering::SeqCst) {
            return Err(BackendError::Rejected(format!(
                "mock rejected image {}",
                spec.image
            )));
        }

        let n = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let job_id = format!("mock-{}", n);
        self.jobs.lock().await.insert(
            job_id.clone(),
            MockJob {
                spec: spec.clone(),
                status: NativeStatus::phase("Running"),
                removed: false,
            },
        );
        Ok(JobHandle::new(job_id))
    }

    async fn get_status(&self, handle: &JobHandle) -> Result<NativeStatus> {
        self.check_reachable()?;
        self.jobs
            .lock()
            .await
            .get(&handle.job_id)
            .map(|job| job.status.clone())
            .ok_or_else(|| BackendError::JobNotFound(handle.job_id.clone()))
    }

    async fn kill(&self, handle: &JobHandle) -> Result<()> {
        self.check_reachable()?;
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&handle.job_id)
            .ok_or_else(|| BackendError::JobNotFound(handle.job_id.clone()))?;
        if !matches!(job.status.phase.as_str(), "Succeeded" | "Failed") {
            job.status = NativeStatus {
                phase: "Failed".to_string(),
                exit_code: Some(137),
                message: Some("Killed".to_string()),
            };
        }
        Ok(())
    }

    async fn remove(&self, handle: &JobHandle) -> Result<()> {
        self.check_reachable()?;
        if let Some(job) = self.jobs.lock().await.get_mut(&handle.job_id) {
            job.removed = true;
        }
        Ok(())
    }

    async fn fetch_logs(&self, handle: &JobHandle) -> Result<LogStream> {
        self.check_reachable()?;
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(&handle.job_id)
            .ok_or_else(|| BackendError::JobNotFound(handle.job_id.clone()))?;
        let line = Bytes::from(format!("{} {}\n", job.spec.image, job.spec.command.join(" ")));
        Ok(Box::pin(stream::iter(vec![Ok(line)])))
    }
}

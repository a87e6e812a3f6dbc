// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Backend trait definitions.
//!
//! Defines the capability surface every container backend offers.

use std::collections::HashMap;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;

use crate::phase::PhaseVocabulary;

/// Errors from backend operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BackendError {
    /// The backend could not be reached when creating a job.
    #[error("No backend available: {0}")]
    NoBackendAvailable(String),

    /// The backend refused to create the job.
    #[error("Backend rejected job: {0}")]
    Rejected(String),

    /// The backend is temporarily unreachable.
    #[error("Backend unreachable: {0}")]
    Unreachable(String),

    /// The backend has no job with this identifier.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("Other: {0}")]
    Other(String),
}

impl BackendError {
    /// Errors worth retrying on a later reconciliation cycle.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            BackendError::Unreachable(_) | BackendError::NoBackendAvailable(_)
        )
    }
}

/// Result type for backend operations.
pub type Result<T> = std::result::Result<T, BackendError>;

/// Everything a backend needs to create a job.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct JobSpec {
    /// Job name (container name or pod name). DNS-label safe.
    pub name: String,
    /// Container image.
    pub image: String,
    /// Command argv. Empty means the image default.
    pub command: Vec<String>,
    /// Environment variables.
    pub env: HashMap<String, String>,
    /// Labels attached to the job.
    pub labels: HashMap<String, String>,
}

/// Handle for a created job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    /// Backend-native identifier (container id for Docker, pod name for Kubernetes).
    pub job_id: String,
    /// When the job was created.
    pub created_at: DateTime<Utc>,
}

impl JobHandle {
    /// Handle for an existing job id.
    pub fn new(job_id: impl Into<String>) -> Self {
        Self {
            job_id: job_id.into(),
            created_at: Utc::now(),
        }
    }
}

/// Status of a job in the backend's own words.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeStatus {
    /// Native phase name, mapped through the backend's [`PhaseVocabulary`].
    pub phase: String,
    /// Exit code, once the job has terminated.
    pub exit_code: Option<i64>,
    /// Free-form backend detail (reason, error message).
    pub message: Option<String>,
}

impl NativeStatus {
    /// Status with only a phase name.
    pub fn phase(phase: impl Into<String>) -> Self {
        Self {
            phase: phase.into(),
            exit_code: None,
            message: None,
        }
    }
}

/// Stream of raw log bytes.
pub type LogStream = BoxStream<'static, Result<Bytes>>;

/// Trait for container backends.
///
/// Backends are PURE execution adapters - they do NOT access the database.
/// Persistence of container records is handled by the caller.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Backend type identifier (e.g., "docker", "kubernetes").
    fn backend_type(&self) -> &'static str;

    /// Native phase vocabulary used by [`Backend::get_status`].
    fn vocabulary(&self) -> &'static PhaseVocabulary;

    /// Create and start a job.
    async fn create_job(&self, spec: &JobSpec) -> Result<JobHandle>;

    /// Query the current native status of a job.
    async fn get_status(&self, handle: &JobHandle) -> Result<NativeStatus>;

    /// Kill a running job. Killing a finished job is not an error.
    async fn kill(&self, handle: &JobHandle) -> Result<()>;

    /// Remove a finished job and its backend resources.
    async fn remove(&self, handle: &JobHandle) -> Result<()>;

    /// Fetch the job's combined stdout/stderr.
    async fn fetch_logs(&self, handle: &JobHandle) -> Result<LogStream>;
}

/// Which backend to run against, chosen once at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Docker engine.
    Docker,
    /// Kubernetes API server.
    Kubernetes,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "docker" => Ok(BackendKind::Docker),
            "kubernetes" | "k8s" => Ok(BackendKind::Kubernetes),
            other => Err(format!("unknown backend '{}'", other)),
        }
    }
}

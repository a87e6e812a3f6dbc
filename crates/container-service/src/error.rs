// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for container-service.

use thiserror::Error;

/// Service errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// No destination is registered under this name.
    #[error("Queue destination unavailable: {0}")]
    TransportUnavailable(String),

    /// The queue rejected the operation (broker or database unreachable).
    #[error("Queue transport error: {0}")]
    Transport(String),

    /// Command resolution failed for the given runtime inputs.
    #[error("Command resolution failed: {0}")]
    Resolution(String),

    /// Backend operation failed.
    #[error("Backend error: {0}")]
    Backend(#[from] crate::backend::BackendError),

    /// An orchestration chain references something that no longer resolves.
    #[error("Orchestration inconsistency: {0}")]
    OrchestrationInconsistency(String),

    /// Container record was not found.
    #[error("Container not found: {0}")]
    ContainerNotFound(String),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the service Error.
pub type Result<T> = std::result::Result<T, Error>;

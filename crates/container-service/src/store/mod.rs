// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces for container records and orchestration definitions.
//!
//! Container records are owned by the service. Orchestration definitions are
//! owned by configuration management and are only ever read here.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::error::Result;
use crate::models::{ContainerRecord, OrchestrationDefinition};
use crate::phase::Phase;

/// Repository for container records.
#[async_trait]
pub trait ContainerStore: Send + Sync {
    /// Persist a freshly launched record.
    async fn create(&self, record: &ContainerRecord) -> Result<()>;

    /// Load one record.
    async fn find_by_id(&self, id: &str) -> Result<Option<ContainerRecord>>;

    /// Records whose phase is not terminal, oldest first.
    async fn find_active(&self) -> Result<Vec<ContainerRecord>>;

    /// Records launched for one workflow.
    async fn find_by_workflow(&self, workflow_id: &str) -> Result<Vec<ContainerRecord>>;

    /// Records of one orchestration run, ordered by chain position.
    async fn find_by_run(&self, orchestration_id: i64, run_id: &str)
    -> Result<Vec<ContainerRecord>>;

    /// Record an observed non-terminal phase change.
    ///
    /// Applies only while the stored phase is still active and differs from
    /// `phase`. Terminal phases go through [`ContainerStore::complete_if_active`].
    async fn update_phase(&self, id: &str, phase: Phase) -> Result<bool>;

    /// Atomically move an active record to a terminal phase.
    ///
    /// Returns `false` without touching the record when it is already
    /// terminal (or missing). Exactly one of several racing callers gets `true`.
    async fn complete_if_active(
        &self,
        id: &str,
        phase: Phase,
        exit_code: Option<&str>,
    ) -> Result<bool>;
}

/// Read-only access to orchestration definitions.
#[async_trait]
pub trait OrchestrationStore: Send + Sync {
    /// Load a definition with its ordered wrapper ids.
    async fn get_orchestration(&self, id: i64) -> Result<Option<OrchestrationDefinition>>;

    /// The orchestration a project has selected, if any (enabled or not).
    async fn selected_for_project(&self, project: &str) -> Result<Option<OrchestrationDefinition>>;
}

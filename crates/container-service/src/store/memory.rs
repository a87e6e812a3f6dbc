// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store for embedding and tests.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{ContainerStore, OrchestrationStore};
use crate::error::{Error, Result};
use crate::models::{ContainerRecord, OrchestrationDefinition};
use crate::phase::Phase;

/// Mutex-guarded maps implementing both store traits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    containers: Mutex<HashMap<String, ContainerRecord>>,
    orchestrations: Mutex<HashMap<i64, OrchestrationDefinition>>,
    selections: Mutex<HashMap<String, i64>>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an orchestration definition.
    pub async fn put_orchestration(&self, definition: OrchestrationDefinition) {
        self.orchestrations
            .lock()
            .await
            .insert(definition.id, definition);
    }

    /// Make `orchestration_id` the project's selected chain.
    pub async fn select_orchestration(&self, project: &str, orchestration_id: i64) {
        self.selections
            .lock()
            .await
            .insert(project.to_string(), orchestration_id);
    }

    /// Enable or disable a stored definition.
    pub async fn set_enabled(&self, orchestration_id: i64, enabled: bool) {
        if let Some(def) = self.orchestrations.lock().await.get_mut(&orchestration_id) {
            def.enabled = enabled;
        }
    }

    /// Drop a definition, leaving its selections dangling.
    pub async fn remove_orchestration(&self, orchestration_id: i64) {
        self.orchestrations.lock().await.remove(&orchestration_id);
    }

    /// Every stored record, oldest first.
    pub async fn all_containers(&self) -> Vec<ContainerRecord> {
        let mut records: Vec<_> = self.containers.lock().await.values().cloned().collect();
        records.sort_by_key(|r| r.created_at);
        records
    }
}

#[async_trait]
impl ContainerStore for MemoryStore {
    async fn create(&self, record: &ContainerRecord) -> Result<()> {
        let mut containers = self.containers.lock().await;
        if containers.contains_key(&record.id) {
            return Err(Error::Other(format!(
                "container record {} already exists",
                record.id
            )));
        }
        containers.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<ContainerRecord>> {
        Ok(self.containers.lock().await.get(id).cloned())
    }

    async fn find_active(&self) -> Result<Vec<ContainerRecord>> {
        let mut records: Vec<_> = self
            .containers
            .lock()
            .await
            .values()
            .filter(|r| !r.phase.is_terminal())
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn find_by_workflow(&self, workflow_id: &str) -> Result<Vec<ContainerRecord>> {
        let mut records: Vec<_> = self
            .containers
            .lock()
            .await
            .values()
            .filter(|r| r.workflow_id == workflow_id)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn find_by_run(
        &self,
        orchestration_id: i64,
        run_id: &str,
    ) -> Result<Vec<ContainerRecord>> {
        let mut records: Vec<_> = self
            .containers
            .lock()
            .await
            .values()
            .filter(|r| {
                r.orchestration.as_ref().is_some_and(|link| {
                    link.orchestration_id == orchestration_id && link.run_id == run_id
                })
            })
            .cloned()
            .collect();
        records.sort_by_key(|r| {
            (
                r.orchestration.as_ref().map(|l| l.position).unwrap_or(0),
                r.created_at,
            )
        });
        Ok(records)
    }

    async fn update_phase(&self, id: &str, phase: Phase) -> Result<bool> {
        let mut containers = self.containers.lock().await;
        match containers.get_mut(id) {
            Some(record) if !record.phase.is_terminal() && record.phase != phase => {
                record.phase = phase;
                record.phase_changed_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_if_active(
        &self,
        id: &str,
        phase: Phase,
        exit_code: Option<&str>,
    ) -> Result<bool> {
        let mut containers = self.containers.lock().await;
        match containers.get_mut(id) {
            Some(record) if !record.phase.is_terminal() => {
                record.phase = phase;
                record.successful = Some(phase.is_successful());
                record.exit_code = exit_code.map(str::to_string);
                record.phase_changed_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl OrchestrationStore for MemoryStore {
    async fn get_orchestration(&self, id: i64) -> Result<Option<OrchestrationDefinition>> {
        Ok(self.orchestrations.lock().await.get(&id).cloned())
    }

    async fn selected_for_project(&self, project: &str) -> Result<Option<OrchestrationDefinition>> {
        let selected = self.selections.lock().await.get(project).copied();
        match selected {
            Some(id) => self.get_orchestration(id).await,
            None => Ok(None),
        }
    }
}

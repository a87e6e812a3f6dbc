// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool, Row};

use super::{ContainerStore, OrchestrationStore};
use crate::error::Result;
use crate::models::{ContainerRecord, OrchestrationDefinition, OrchestrationLink};
use crate::phase::Phase;

const CONTAINER_COLUMNS: &str = r#"
    id, backend, job_id, phase, exit_code, successful, project, username,
    workflow_id, wrapper_id, command_id, wrapper_name, input_values,
    orchestration_id, orchestration_run_id, orchestration_position,
    created_at, phase_changed_at
"#;

/// Active phases as stored in the `phase` column.
fn active_phases() -> Vec<String> {
    Phase::ACTIVE.iter().map(|p| p.as_str().to_string()).collect()
}

impl<'r> FromRow<'r, PgRow> for ContainerRecord {
    fn from_row(row: &'r PgRow) -> std::result::Result<Self, sqlx::Error> {
        let phase: String = row.try_get("phase")?;
        let phase = phase
            .parse::<Phase>()
            .map_err(|e| sqlx::Error::ColumnDecode {
                index: "phase".to_string(),
                source: Box::new(e),
            })?;

        let input_values: Json<HashMap<String, String>> = row.try_get("input_values")?;

        let orchestration_id: Option<i64> = row.try_get("orchestration_id")?;
        let run_id: Option<String> = row.try_get("orchestration_run_id")?;
        let position: Option<i32> = row.try_get("orchestration_position")?;
        let orchestration = match (orchestration_id, run_id, position) {
            (Some(orchestration_id), Some(run_id), Some(position)) => Some(OrchestrationLink {
                orchestration_id,
                run_id,
                position: position.max(0) as usize,
            }),
            _ => None,
        };

        Ok(Self {
            id: row.try_get("id")?,
            backend: row.try_get("backend")?,
            job_id: row.try_get("job_id")?,
            phase,
            exit_code: row.try_get("exit_code")?,
            successful: row.try_get("successful")?,
            project: row.try_get("project")?,
            username: row.try_get("username")?,
            workflow_id: row.try_get("workflow_id")?,
            wrapper_id: row.try_get("wrapper_id")?,
            command_id: row.try_get("command_id")?,
            wrapper_name: row.try_get("wrapper_name")?,
            input_values: input_values.0,
            orchestration,
            created_at: row.try_get("created_at")?,
            phase_changed_at: row.try_get("phase_changed_at")?,
        })
    }
}

/// PostgreSQL-backed implementation of both store traits.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl ContainerStore for PostgresStore {
    async fn create(&self, record: &ContainerRecord) -> Result<()> {
        let link = record.orchestration.as_ref();

        sqlx::query(
            r#"
            INSERT INTO containers (
                id, backend, job_id, phase, exit_code, successful, project, username,
                workflow_id, wrapper_id, command_id, wrapper_name, input_values,
                orchestration_id, orchestration_run_id, orchestration_position,
                created_at, phase_changed_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(&record.id)
        .bind(&record.backend)
        .bind(&record.job_id)
        .bind(record.phase.as_str())
        .bind(&record.exit_code)
        .bind(record.successful)
        .bind(&record.project)
        .bind(&record.username)
        .bind(&record.workflow_id)
        .bind(record.wrapper_id)
        .bind(record.command_id)
        .bind(&record.wrapper_name)
        .bind(Json(&record.input_values))
        .bind(link.map(|l| l.orchestration_id))
        .bind(link.map(|l| l.run_id.clone()))
        .bind(link.map(|l| l.position as i32))
        .bind(record.created_at)
        .bind(record.phase_changed_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn find_by_id(&self, id: &str) -> Result<Option<ContainerRecord>> {
        let record = sqlx::query_as::<_, ContainerRecord>(&format!(
            "SELECT {} FROM containers WHERE id = $1",
            CONTAINER_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn find_active(&self) -> Result<Vec<ContainerRecord>> {
        let records = sqlx::query_as::<_, ContainerRecord>(&format!(
            "SELECT {} FROM containers WHERE phase = ANY($1) ORDER BY created_at",
            CONTAINER_COLUMNS
        ))
        .bind(active_phases())
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn find_by_workflow(&self, workflow_id: &str) -> Result<Vec<ContainerRecord>> {
        let records = sqlx::query_as::<_, ContainerRecord>(&format!(
            "SELECT {} FROM containers WHERE workflow_id = $1 ORDER BY created_at",
            CONTAINER_COLUMNS
        ))
        .bind(workflow_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn find_by_run(
        &self,
        orchestration_id: i64,
        run_id: &str,
    ) -> Result<Vec<ContainerRecord>> {
        let records = sqlx::query_as::<_, ContainerRecord>(&format!(
            r#"
            SELECT {} FROM containers
            WHERE orchestration_id = $1 AND orchestration_run_id = $2
            ORDER BY orchestration_position, created_at
            "#,
            CONTAINER_COLUMNS
        ))
        .bind(orchestration_id)
        .bind(run_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn update_phase(&self, id: &str, phase: Phase) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE containers
            SET phase = $2, phase_changed_at = NOW()
            WHERE id = $1 AND phase = ANY($3) AND phase <> $2
            "#,
        )
        .bind(id)
        .bind(phase.as_str())
        .bind(active_phases())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn complete_if_active(
        &self,
        id: &str,
        phase: Phase,
        exit_code: Option<&str>,
    ) -> Result<bool> {
        // Single conditional UPDATE: racing finalizers cannot both see an active row.
        let result = sqlx::query(
            r#"
            UPDATE containers
            SET phase = $2, successful = $3, exit_code = $4, phase_changed_at = NOW()
            WHERE id = $1 AND phase = ANY($5)
            "#,
        )
        .bind(id)
        .bind(phase.as_str())
        .bind(phase.is_successful())
        .bind(exit_code)
        .bind(active_phases())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}

#[async_trait]
impl OrchestrationStore for PostgresStore {
    async fn get_orchestration(&self, id: i64) -> Result<Option<OrchestrationDefinition>> {
        let row = sqlx::query(
            "SELECT id, name, enabled, halt_on_command_failure FROM orchestrations WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let wrapper_ids: Vec<i64> = sqlx::query_scalar(
            r#"
            SELECT wrapper_id FROM orchestration_wrappers
            WHERE orchestration_id = $1
            ORDER BY position
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;

        Ok(Some(OrchestrationDefinition {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            enabled: row.try_get("enabled")?,
            halt_on_command_failure: row.try_get("halt_on_command_failure")?,
            wrapper_ids,
        }))
    }

    async fn selected_for_project(&self, project: &str) -> Result<Option<OrchestrationDefinition>> {
        let selected: Option<i64> = sqlx::query_scalar(
            "SELECT orchestration_id FROM orchestration_projects WHERE project = $1",
        )
        .bind(project)
        .fetch_optional(&self.pool)
        .await?;

        match selected {
            Some(id) => self.get_orchestration(id).await,
            None => Ok(None),
        }
    }
}

// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! External collaborators and their default adapters.
//!
//! The service only talks to the surrounding platform through these traits:
//! command resolution, workflow bookkeeping, user notification and the shared
//! settings store. The adapters here are what the binary wires in.

use std::collections::HashMap;

use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use tokio::sync::RwLock;
use tracing::{error, warn};

use crate::error::{Error, Result};
use crate::models::{ResolvedCommand, WrapperSummary};

/// Resolves command wrappers against runtime inputs.
#[async_trait]
pub trait CommandResolver: Send + Sync {
    /// Produce a launchable command. Fails with [`Error::Resolution`] when the
    /// wrapper is unknown or an input is missing.
    async fn resolve(
        &self,
        wrapper_id: i64,
        input_values: &HashMap<String, String>,
    ) -> Result<ResolvedCommand>;

    /// Identity of a wrapper, or `None` if it no longer exists.
    async fn describe(&self, wrapper_id: i64) -> Result<Option<WrapperSummary>>;
}

/// Workflow status bookkeeping.
#[async_trait]
pub trait WorkflowTracker: Send + Sync {
    /// Set the human-readable status of a workflow.
    async fn set_status(&self, workflow_id: &str, status: &str, detail: Option<&str>)
    -> Result<()>;
}

/// User notification (mail in the full platform).
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Tell a user something failed.
    async fn notify_failure(&self, user: &str, subject: &str, body: &str) -> Result<()>;
}

/// Shared, operator-tunable settings.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    /// Raw `(min, max)` consumer concurrency for a destination, unvalidated.
    async fn concurrency_settings(&self, destination: &str) -> Result<Option<(i64, i64)>>;
}

/// Set a workflow status, logging instead of failing.
pub(crate) async fn record_status(
    tracker: &dyn WorkflowTracker,
    workflow_id: &str,
    status: &str,
    detail: Option<&str>,
) {
    if let Err(e) = tracker.set_status(workflow_id, status, detail).await {
        error!(
            workflow_id = %workflow_id,
            status = %status,
            error = %e,
            "Failed to update workflow status"
        );
    }
}

/// Notify a user, logging instead of failing.
pub(crate) async fn send_failure_notice(
    notifier: &dyn Notifier,
    user: &str,
    subject: &str,
    body: &str,
) {
    if let Err(e) = notifier.notify_failure(user, subject, body).await {
        warn!(user = %user, subject = %subject, error = %e, "Failed to notify user");
    }
}

/// Substitute `#name#` placeholders from `inputs`.
///
/// A `#...#` span whose content is not a plain identifier is left untouched.
pub fn substitute_inputs(
    template: &str,
    inputs: &HashMap<String, String>,
) -> std::result::Result<String, String> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find('#') {
        out.push_str(&rest[..start]);
        let after = &rest[start + 1..];
        match after.find('#') {
            Some(end)
                if end > 0
                    && after[..end]
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-') =>
            {
                let name = &after[..end];
                let value = inputs
                    .get(name)
                    .ok_or_else(|| format!("no value for input '{}'", name))?;
                out.push_str(value);
                rest = &after[end + 1..];
            }
            _ => {
                out.push('#');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Resolver reading wrapper templates from the `command_wrappers` table.
#[derive(Debug, Clone)]
pub struct StoredCommandResolver {
    pool: PgPool,
}

impl StoredCommandResolver {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CommandResolver for StoredCommandResolver {
    async fn resolve(
        &self,
        wrapper_id: i64,
        input_values: &HashMap<String, String>,
    ) -> Result<ResolvedCommand> {
        let row = sqlx::query(
            "SELECT image, command, environment FROM command_wrappers WHERE wrapper_id = $1",
        )
        .bind(wrapper_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::Resolution(format!("command wrapper {} not found", wrapper_id)))?;

        let image: String = row.try_get("image")?;
        let command: Json<Vec<String>> = row.try_get("command")?;
        let environment: Json<HashMap<String, String>> = row.try_get("environment")?;

        let command = command
            .0
            .iter()
            .map(|arg| substitute_inputs(arg, input_values))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Error::Resolution)?;

        let env = environment
            .0
            .into_iter()
            .map(|(key, value)| Ok((key, substitute_inputs(&value, input_values)?)))
            .collect::<std::result::Result<HashMap<_, _>, String>>()
            .map_err(Error::Resolution)?;

        Ok(ResolvedCommand {
            wrapper_id,
            image,
            command,
            env,
        })
    }

    async fn describe(&self, wrapper_id: i64) -> Result<Option<WrapperSummary>> {
        let row = sqlx::query(
            "SELECT wrapper_id, command_id, wrapper_name FROM command_wrappers WHERE wrapper_id = $1",
        )
        .bind(wrapper_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            Ok::<_, Error>(WrapperSummary {
                wrapper_id: row.try_get("wrapper_id")?,
                command_id: row.try_get("command_id")?,
                wrapper_name: row.try_get("wrapper_name")?,
            })
        })
        .transpose()
    }
}

/// Tracker upserting into the `workflows` table.
#[derive(Debug, Clone)]
pub struct PostgresWorkflowTracker {
    pool: PgPool,
}

impl PostgresWorkflowTracker {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl WorkflowTracker for PostgresWorkflowTracker {
    async fn set_status(
        &self,
        workflow_id: &str,
        status: &str,
        detail: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO workflows (workflow_id, status, details, updated_at)
            VALUES ($1, $2, $3, NOW())
            ON CONFLICT (workflow_id)
            DO UPDATE SET status = EXCLUDED.status, details = EXCLUDED.details, updated_at = NOW()
            "#,
        )
        .bind(workflow_id)
        .bind(status)
        .bind(detail)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

/// Notifier that writes the notification to the log.
#[derive(Debug, Clone, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_failure(&self, user: &str, subject: &str, body: &str) -> Result<()> {
        warn!(user = %user, subject = %subject, body = %body, "Failure notification");
        Ok(())
    }
}

/// Settings read from the `queue_settings` table.
#[derive(Debug, Clone)]
pub struct PostgresSettingsStore {
    pool: PgPool,
}

impl PostgresSettingsStore {
    /// Wrap a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for PostgresSettingsStore {
    async fn concurrency_settings(&self, destination: &str) -> Result<Option<(i64, i64)>> {
        let row = sqlx::query(
            "SELECT min_consumers, max_consumers FROM queue_settings WHERE destination = $1",
        )
        .bind(destination)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|row| {
            let min: i32 = row.try_get("min_consumers")?;
            let max: i32 = row.try_get("max_consumers")?;
            Ok::<_, Error>((i64::from(min), i64::from(max)))
        })
        .transpose()
    }
}

/// In-memory settings, mutable at runtime.
#[derive(Debug, Default)]
pub struct StaticSettings {
    values: RwLock<HashMap<String, (i64, i64)>>,
}

impl StaticSettings {
    /// Empty settings: every destination keeps its current bounds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the raw bounds for a destination.
    pub async fn set(&self, destination: &str, min: i64, max: i64) {
        self.values
            .write()
            .await
            .insert(destination.to_string(), (min, max));
    }
}

#[async_trait]
impl SettingsStore for StaticSettings {
    async fn concurrency_settings(&self, destination: &str) -> Result<Option<(i64, i64)>> {
        Ok(self.values.read().await.get(destination).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_substitute_inputs() {
        let values = inputs(&[("session", "XNAT_E001"), ("out-dir", "/output")]);
        assert_eq!(
            substitute_inputs("--session=#session# -o #out-dir#", &values).unwrap(),
            "--session=XNAT_E001 -o /output"
        );
    }

    #[test]
    fn test_substitute_missing_input() {
        let err = substitute_inputs("#session#", &HashMap::new()).unwrap_err();
        assert!(err.contains("session"));
    }

    #[test]
    fn test_substitute_leaves_non_placeholders() {
        let values = inputs(&[("a", "1")]);
        assert_eq!(substitute_inputs("# comment", &values).unwrap(), "# comment");
        assert_eq!(substitute_inputs("x ## y", &values).unwrap(), "x ## y");
        assert_eq!(substitute_inputs("#a b# #a#", &values).unwrap(), "#a b# 1");
    }

    #[tokio::test]
    async fn test_static_settings() {
        let settings = StaticSettings::new();
        assert_eq!(settings.concurrency_settings("staging").await.unwrap(), None);
        settings.set("staging", 2, 5).await;
        assert_eq!(
            settings.concurrency_settings("staging").await.unwrap(),
            Some((2, 5))
        );
    }
}

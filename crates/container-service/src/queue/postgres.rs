// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL-backed queue transport.
//!
//! Messages live in `queue_messages`. A receive claims one visible row with
//! `FOR UPDATE SKIP LOCKED` and pushes its `visible_at` forward by the
//! visibility timeout; ack deletes the row. A consumer that dies before acking
//! lets the claim lapse and the message becomes visible again.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tokio::time::Instant;
use tracing::debug;

use super::traits::{Delivery, Transport};
use crate::error::{Error, Result};

/// Tuning for [`PostgresQueue`].
#[derive(Debug, Clone)]
pub struct PostgresQueueConfig {
    /// How often an empty destination is polled during `receive`.
    pub poll_interval: Duration,
    /// How long a claimed message stays invisible before redelivery.
    pub visibility_timeout: Duration,
}

impl Default for PostgresQueueConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            visibility_timeout: Duration::from_secs(300),
        }
    }
}

/// Queue transport storing messages in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresQueue {
    pool: PgPool,
    destinations: HashSet<String>,
    config: PostgresQueueConfig,
}

impl PostgresQueue {
    /// Create a transport serving the given destinations.
    pub fn new(pool: PgPool, destinations: &[&str]) -> Self {
        Self::with_config(pool, destinations, PostgresQueueConfig::default())
    }

    /// Create a transport with explicit tuning.
    pub fn with_config(pool: PgPool, destinations: &[&str], config: PostgresQueueConfig) -> Self {
        Self {
            pool,
            destinations: destinations.iter().map(|d| d.to_string()).collect(),
            config,
        }
    }

    fn check_destination(&self, destination: &str) -> Result<()> {
        if self.destinations.contains(destination) {
            Ok(())
        } else {
            Err(Error::TransportUnavailable(destination.to_string()))
        }
    }

    async fn claim(&self, destination: &str) -> Result<Option<Delivery>> {
        let row = sqlx::query(
            r#"
            UPDATE queue_messages
            SET visible_at = NOW() + make_interval(secs => $2::double precision),
                delivery_count = delivery_count + 1
            WHERE id = (
                SELECT id FROM queue_messages
                WHERE destination = $1 AND visible_at <= NOW()
                ORDER BY id
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, payload, delivery_count
            "#,
        )
        .bind(destination)
        .bind(self.config.visibility_timeout.as_secs_f64())
        .fetch_optional(&self.pool)
        .await
        .map_err(transport_error)?;

        Ok(row.map(|row| Delivery {
            id: row.get("id"),
            destination: destination.to_string(),
            payload: row.get("payload"),
            delivery_count: row.get::<i32, _>("delivery_count").max(0) as u32,
        }))
    }
}

fn transport_error(err: sqlx::Error) -> Error {
    Error::Transport(err.to_string())
}

#[async_trait]
impl Transport for PostgresQueue {
    async fn enqueue(&self, destination: &str, payload: Vec<u8>) -> Result<()> {
        self.check_destination(destination)?;

        sqlx::query("INSERT INTO queue_messages (destination, payload) VALUES ($1, $2)")
            .bind(destination)
            .bind(payload)
            .execute(&self.pool)
            .await
            .map_err(transport_error)?;

        Ok(())
    }

    async fn receive(&self, destination: &str, wait: Duration) -> Result<Option<Delivery>> {
        self.check_destination(destination)?;

        let deadline = Instant::now() + wait;
        loop {
            if let Some(delivery) = self.claim(destination).await? {
                if delivery.delivery_count > 1 {
                    debug!(
                        message_id = delivery.id,
                        destination = %destination,
                        delivery_count = delivery.delivery_count,
                        "Redelivering message"
                    );
                }
                return Ok(Some(delivery));
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            tokio::time::sleep(remaining.min(self.config.poll_interval)).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        sqlx::query("DELETE FROM queue_messages WHERE id = $1")
            .bind(delivery.id)
            .execute(&self.pool)
            .await
            .map_err(transport_error)?;
        Ok(())
    }

    async fn depth(&self, destination: &str) -> Result<u64> {
        self.check_destination(destination)?;

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM queue_messages WHERE destination = $1")
                .bind(destination)
                .fetch_one(&self.pool)
                .await
                .map_err(transport_error)?;

        Ok(count.max(0) as u64)
    }
}

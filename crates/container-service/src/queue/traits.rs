// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue transport trait definitions.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::Result;

/// A message handed to one consumer.
///
/// The message stays claimed until [`Transport::ack`] is called. Unacknowledged
/// messages are redelivered (at-least-once).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Transport-assigned message id.
    pub id: i64,
    /// Destination the message was received from.
    pub destination: String,
    /// Raw payload.
    pub payload: Vec<u8>,
    /// How many times this message has been handed out, including this time.
    pub delivery_count: u32,
}

/// Asynchronous message channel with named destinations.
///
/// `enqueue` must surface rejection immediately: callers rely on the error to
/// record a user-visible failure.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Append a message to a destination.
    ///
    /// Fails with `TransportUnavailable` for unregistered destinations and
    /// `Transport` when the channel rejects the send.
    async fn enqueue(&self, destination: &str, payload: Vec<u8>) -> Result<()>;

    /// Claim the next message, waiting up to `wait` for one to arrive.
    async fn receive(&self, destination: &str, wait: Duration) -> Result<Option<Delivery>>;

    /// Acknowledge a claimed message so it is never redelivered.
    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    /// Number of unacknowledged messages. Observability only.
    async fn depth(&self, destination: &str) -> Result<u64>;
}

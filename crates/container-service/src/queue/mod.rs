// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Queue transport, typed publishing and consumer pools.

pub mod memory;
pub mod pool;
pub mod postgres;
mod traits;

use std::sync::Arc;

use serde::Serialize;
use tracing::debug;

pub use memory::MemoryQueue;
pub use pool::{ConcurrencySettings, ConsumerPool, ConsumerPoolConfig, MessageHandler};
pub use postgres::{PostgresQueue, PostgresQueueConfig};
pub use traits::*;

use crate::error::Result;
use crate::models::{FinalizeRequest, LaunchRequest};

/// Destination consumed by the staging consumer.
pub const STAGING: &str = "staging";

/// Destination consumed by the finalizing consumer.
pub const FINALIZING: &str = "finalizing";

/// Every destination the service registers.
pub const DESTINATIONS: [&str; 2] = [STAGING, FINALIZING];

/// Publishes typed messages as JSON onto the service destinations.
#[derive(Clone)]
pub struct Publisher {
    transport: Arc<dyn Transport>,
}

impl Publisher {
    /// Wrap a transport.
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self { transport }
    }

    /// Underlying transport.
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Enqueue a launch request on the staging destination.
    pub async fn publish_launch(&self, request: &LaunchRequest) -> Result<()> {
        self.publish(STAGING, request).await?;
        debug!(
            workflow_id = %request.workflow_id,
            wrapper_id = request.wrapper_id,
            "Launch request enqueued"
        );
        Ok(())
    }

    /// Enqueue a finalize request on the finalizing destination.
    pub async fn publish_finalize(&self, request: &FinalizeRequest) -> Result<()> {
        self.publish(FINALIZING, request).await?;
        debug!(
            container_id = %request.container_id,
            successful = request.successful,
            "Finalize request enqueued"
        );
        Ok(())
    }

    /// Unconsumed message count for a destination.
    pub async fn depth(&self, destination: &str) -> Result<u64> {
        self.transport.depth(destination).await
    }

    async fn publish<T: Serialize>(&self, destination: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_vec(message)?;
        self.transport.enqueue(destination, payload).await
    }
}

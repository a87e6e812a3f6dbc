// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker applying shared concurrency settings to live pools.
//!
//! Every service instance runs its own controller against the same settings
//! store, so all instances converge on the operator's `[min, max]` without a
//! restart. Settings that fail validation are ignored and the pool keeps its
//! current bounds.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::collaborators::SettingsStore;
use crate::queue::{ConcurrencySettings, ConsumerPool};

/// Configuration for the concurrency controller.
#[derive(Debug, Clone)]
pub struct ConcurrencyControllerConfig {
    /// How often settings are re-read.
    pub refresh_interval: Duration,
}

impl Default for ConcurrencyControllerConfig {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(10),
        }
    }
}

/// Periodically re-reads consumer concurrency settings.
pub struct ConcurrencyController {
    settings: Arc<dyn SettingsStore>,
    pools: Vec<Arc<ConsumerPool>>,
    config: ConcurrencyControllerConfig,
    shutdown: Arc<Notify>,
}

impl ConcurrencyController {
    /// Create a controller for the given pools.
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        pools: Vec<Arc<ConsumerPool>>,
        config: ConcurrencyControllerConfig,
    ) -> Self {
        Self {
            settings,
            pools,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the refresh loop until shutdown is signalled.
    pub async fn run(&self) {
        info!(
            refresh_interval_secs = self.config.refresh_interval.as_secs(),
            pools = self.pools.len(),
            "Concurrency controller started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Concurrency controller received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.refresh_interval) => {
                    self.refresh().await;
                }
            }
        }

        info!("Concurrency controller stopped");
    }

    /// Re-read settings once and apply them. Returns how many pools changed.
    pub async fn refresh(&self) -> usize {
        let mut changed = 0;

        for pool in &self.pools {
            let destination = pool.destination();
            let raw = match self.settings.concurrency_settings(destination).await {
                Ok(Some(raw)) => raw,
                Ok(None) => continue,
                Err(e) => {
                    error!(destination = %destination, error = %e, "Failed to read concurrency settings");
                    continue;
                }
            };

            let Some(settings) = validate(raw) else {
                warn!(
                    destination = %destination,
                    min = raw.0,
                    max = raw.1,
                    "Ignoring invalid concurrency settings"
                );
                continue;
            };

            if pool.set_concurrency(settings) {
                changed += 1;
            }
        }

        changed
    }
}

fn validate((min, max): (i64, i64)) -> Option<ConcurrencySettings> {
    let min = usize::try_from(min).ok()?;
    let max = usize::try_from(max).ok()?;
    ConcurrencySettings::new(min, max)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate() {
        assert_eq!(validate((2, 8)), ConcurrencySettings::new(2, 8));
        assert_eq!(validate((0, 8)), None);
        assert_eq!(validate((9, 8)), None);
        assert_eq!(validate((-1, 8)), None);
    }
}

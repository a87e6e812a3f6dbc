// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Consumer pool - per-destination workers with live `[min, max]` bounds.
//!
//! The pool starts `min` workers. When a worker picks up a message and every
//! worker is busy, one more worker is spawned (up to `max`). Workers that stay
//! idle retire while the pool is above `min`. Lowering `max` never interrupts
//! a handler: workers only check the bound between messages.

use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use super::traits::{Delivery, Transport};

/// Handles one message payload.
///
/// Handlers own their failure policy: whatever happens, the message is
/// acknowledged once `handle` returns.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process one payload.
    async fn handle(&self, payload: &[u8]);
}

/// Consumer concurrency range for one destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConcurrencySettings {
    /// Workers kept alive while idle.
    pub min: usize,
    /// Upper bound on parallel handlers.
    pub max: usize,
}

impl ConcurrencySettings {
    /// Validated constructor: `1 <= min <= max`.
    pub fn new(min: usize, max: usize) -> Option<Self> {
        if min >= 1 && max >= min {
            Some(Self { min, max })
        } else {
            None
        }
    }
}

impl Default for ConcurrencySettings {
    fn default() -> Self {
        Self { min: 1, max: 10 }
    }
}

impl FromStr for ConcurrencySettings {
    type Err = String;

    /// Parse `"min-max"` (e.g. `"1-10"`) or a single fixed size (`"4"`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (min, max) = match s.split_once('-') {
            Some((min, max)) => (min.trim(), max.trim()),
            None => (s, s),
        };
        let min: usize = min
            .parse()
            .map_err(|_| format!("invalid concurrency minimum in '{}'", s))?;
        let max: usize = max
            .parse()
            .map_err(|_| format!("invalid concurrency maximum in '{}'", s))?;
        Self::new(min, max).ok_or_else(|| format!("concurrency '{}' must satisfy 1 <= min <= max", s))
    }
}

/// Tuning for [`ConsumerPool`].
#[derive(Debug, Clone)]
pub struct ConsumerPoolConfig {
    /// How long one receive call waits for a message.
    pub receive_wait: Duration,
    /// Consecutive empty receives after which a worker above `min` retires.
    pub idle_receives_before_retire: u32,
}

impl Default for ConsumerPoolConfig {
    fn default() -> Self {
        Self {
            receive_wait: Duration::from_secs(1),
            idle_receives_before_retire: 5,
        }
    }
}

struct PoolState {
    destination: String,
    transport: Arc<dyn Transport>,
    handler: Arc<dyn MessageHandler>,
    config: ConsumerPoolConfig,
    min: AtomicUsize,
    max: AtomicUsize,
    workers: AtomicUsize,
    busy: AtomicUsize,
    stopping: AtomicBool,
    drained: Notify,
}

impl PoolState {
    /// Reserve a worker slot if fewer than `limit` workers run.
    fn reserve_slot(&self, limit: usize) -> bool {
        self.workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < limit).then_some(current + 1)
            })
            .is_ok()
    }

    /// Release this worker's slot if more than `floor` workers run.
    fn try_retire(&self, floor: usize) -> bool {
        let retired = self
            .workers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current > floor).then(|| current - 1)
            })
            .is_ok();
        if retired {
            self.drained.notify_waiters();
        }
        retired
    }

    fn release_slot(&self) {
        self.workers.fetch_sub(1, Ordering::SeqCst);
        self.drained.notify_waiters();
    }

    async fn process(&self, delivery: Delivery) {
        let handler = self.handler.clone();
        let payload = delivery.payload.clone();

        // Run the handler in its own task so a panic cannot take the worker down.
        if let Err(e) = tokio::spawn(async move { handler.handle(&payload).await }).await {
            error!(
                destination = %self.destination,
                message_id = delivery.id,
                error = %e,
                "Message handler panicked"
            );
        }

        if let Err(e) = self.transport.ack(&delivery).await {
            warn!(
                destination = %self.destination,
                message_id = delivery.id,
                error = %e,
                "Failed to acknowledge message, it will be redelivered"
            );
        }
    }
}

/// Spawn one worker if the pool is below `limit`.
fn spawn_worker(state: &Arc<PoolState>, limit: usize) -> bool {
    if state.stopping.load(Ordering::SeqCst) || !state.reserve_slot(limit) {
        return false;
    }
    let worker_state = state.clone();
    tokio::spawn(async move { worker_loop(worker_state).await });
    true
}

async fn worker_loop(state: Arc<PoolState>) {
    let mut idle_receives = 0u32;

    loop {
        if state.stopping.load(Ordering::SeqCst) {
            state.release_slot();
            return;
        }

        // Shrink between messages only.
        if state.try_retire(state.max.load(Ordering::SeqCst)) {
            debug!(destination = %state.destination, "Worker retired above max");
            return;
        }

        match state
            .transport
            .receive(&state.destination, state.config.receive_wait)
            .await
        {
            Ok(Some(delivery)) => {
                idle_receives = 0;
                let busy = state.busy.fetch_add(1, Ordering::SeqCst) + 1;
                if busy >= state.workers.load(Ordering::SeqCst) {
                    spawn_worker(&state, state.max.load(Ordering::SeqCst));
                }
                state.process(delivery).await;
                state.busy.fetch_sub(1, Ordering::SeqCst);
            }
            Ok(None) => {
                idle_receives += 1;
                if idle_receives >= state.config.idle_receives_before_retire {
                    idle_receives = 0;
                    if state.try_retire(state.min.load(Ordering::SeqCst)) {
                        debug!(destination = %state.destination, "Idle worker retired");
                        return;
                    }
                }
            }
            Err(e) => {
                warn!(
                    destination = %state.destination,
                    error = %e,
                    "Queue receive failed"
                );
                tokio::time::sleep(state.config.receive_wait).await;
            }
        }
    }
}

/// Worker pool consuming one destination.
pub struct ConsumerPool {
    state: Arc<PoolState>,
}

impl ConsumerPool {
    /// Create a pool. No worker runs until [`ConsumerPool::start`].
    pub fn new(
        destination: impl Into<String>,
        transport: Arc<dyn Transport>,
        handler: Arc<dyn MessageHandler>,
        settings: ConcurrencySettings,
        config: ConsumerPoolConfig,
    ) -> Self {
        Self {
            state: Arc::new(PoolState {
                destination: destination.into(),
                transport,
                handler,
                config,
                min: AtomicUsize::new(settings.min),
                max: AtomicUsize::new(settings.max),
                workers: AtomicUsize::new(0),
                busy: AtomicUsize::new(0),
                stopping: AtomicBool::new(false),
                drained: Notify::new(),
            }),
        }
    }

    /// Destination consumed by this pool.
    pub fn destination(&self) -> &str {
        &self.state.destination
    }

    /// Spawn the `min` workers.
    pub fn start(&self) {
        let min = self.state.min.load(Ordering::SeqCst);
        while spawn_worker(&self.state, min) {}
        info!(
            destination = %self.state.destination,
            workers = self.worker_count(),
            "Consumer pool started"
        );
    }

    /// Current bounds.
    pub fn concurrency(&self) -> ConcurrencySettings {
        ConcurrencySettings {
            min: self.state.min.load(Ordering::SeqCst),
            max: self.state.max.load(Ordering::SeqCst),
        }
    }

    /// Apply new bounds to the live pool. Returns whether anything changed.
    ///
    /// Raising `min` spawns workers right away. Lowering `max` lets busy
    /// workers finish their message before they retire.
    pub fn set_concurrency(&self, settings: ConcurrencySettings) -> bool {
        if settings == self.concurrency() {
            return false;
        }
        self.state.min.store(settings.min, Ordering::SeqCst);
        self.state.max.store(settings.max, Ordering::SeqCst);
        while spawn_worker(&self.state, settings.min) {}
        info!(
            destination = %self.state.destination,
            min = settings.min,
            max = settings.max,
            "Consumer concurrency updated"
        );
        true
    }

    /// Number of live workers.
    pub fn worker_count(&self) -> usize {
        self.state.workers.load(Ordering::SeqCst)
    }

    /// Number of workers currently inside a handler.
    pub fn busy_count(&self) -> usize {
        self.state.busy.load(Ordering::SeqCst)
    }

    /// Stop accepting messages and wait up to `timeout` for workers to drain.
    ///
    /// Returns `true` when every worker exited in time.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        self.state.stopping.store(true, Ordering::SeqCst);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let drained = self.state.drained.notified();
            tokio::pin!(drained);
            drained.as_mut().enable();

            if self.worker_count() == 0 {
                info!(destination = %self.state.destination, "Consumer pool stopped");
                return true;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(
                    destination = %self.state.destination,
                    workers = self.worker_count(),
                    "Consumer pool shutdown timed out"
                );
                return false;
            }
        }
    }
}

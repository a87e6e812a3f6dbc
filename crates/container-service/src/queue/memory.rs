// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process queue transport.
//!
//! Used when the service is embedded in a single process, and in tests.
//! Messages do not survive a restart.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;

use super::traits::{Delivery, Transport};
use crate::error::{Error, Result};

#[derive(Debug)]
struct StoredMessage {
    id: i64,
    payload: Vec<u8>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct DestinationQueue {
    ready: VecDeque<StoredMessage>,
    in_flight: HashMap<i64, StoredMessage>,
    notify: Arc<Notify>,
}

/// In-memory transport with registered destinations.
#[derive(Debug, Default)]
pub struct MemoryQueue {
    destinations: Mutex<HashMap<String, DestinationQueue>>,
    next_id: AtomicI64,
    rejecting: AtomicBool,
}

impl MemoryQueue {
    /// Create a queue with the given destinations registered.
    pub fn new(destinations: &[&str]) -> Self {
        let destinations = destinations
            .iter()
            .map(|name| (name.to_string(), DestinationQueue::default()))
            .collect();
        Self {
            destinations: Mutex::new(destinations),
            next_id: AtomicI64::new(0),
            rejecting: AtomicBool::new(false),
        }
    }

    /// Register another destination.
    pub async fn register(&self, destination: &str) {
        self.destinations
            .lock()
            .await
            .entry(destination.to_string())
            .or_default();
    }

    /// Make every subsequent enqueue fail, as if the broker were unreachable.
    pub fn set_rejecting(&self, rejecting: bool) {
        self.rejecting.store(rejecting, Ordering::SeqCst);
    }

    /// Return every claimed-but-unacknowledged message to the front of its
    /// destination, as a broker does when a consumer dies before acking.
    pub async fn requeue_unacked(&self) -> usize {
        let mut destinations = self.destinations.lock().await;
        let mut requeued = 0;
        for queue in destinations.values_mut() {
            let mut pending: Vec<StoredMessage> = queue.in_flight.drain().map(|(_, m)| m).collect();
            pending.sort_by_key(|m| std::cmp::Reverse(m.id));
            requeued += pending.len();
            for message in pending {
                queue.ready.push_front(message);
            }
            queue.notify.notify_one();
        }
        requeued
    }
}

#[async_trait]
impl Transport for MemoryQueue {
    async fn enqueue(&self, destination: &str, payload: Vec<u8>) -> Result<()> {
        let mut destinations = self.destinations.lock().await;
        let queue = destinations
            .get_mut(destination)
            .ok_or_else(|| Error::TransportUnavailable(destination.to_string()))?;

        if self.rejecting.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!(
                "destination '{}' is not accepting messages",
                destination
            )));
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        queue.ready.push_back(StoredMessage {
            id,
            payload,
            delivery_count: 0,
        });
        queue.notify.notify_one();
        Ok(())
    }

    async fn receive(&self, destination: &str, wait: Duration) -> Result<Option<Delivery>> {
        let deadline = Instant::now() + wait;
        loop {
            let notify = {
                let mut destinations = self.destinations.lock().await;
                let queue = destinations
                    .get_mut(destination)
                    .ok_or_else(|| Error::TransportUnavailable(destination.to_string()))?;

                if let Some(mut message) = queue.ready.pop_front() {
                    message.delivery_count += 1;
                    let delivery = Delivery {
                        id: message.id,
                        destination: destination.to_string(),
                        payload: message.payload.clone(),
                        delivery_count: message.delivery_count,
                    };
                    queue.in_flight.insert(message.id, message);
                    return Ok(Some(delivery));
                }
                queue.notify.clone()
            };

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let _ = tokio::time::timeout(remaining, notify.notified()).await;
        }
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut destinations = self.destinations.lock().await;
        let queue = destinations
            .get_mut(&delivery.destination)
            .ok_or_else(|| Error::TransportUnavailable(delivery.destination.clone()))?;
        queue.in_flight.remove(&delivery.id);
        Ok(())
    }

    async fn depth(&self, destination: &str) -> Result<u64> {
        let destinations = self.destinations.lock().await;
        let queue = destinations
            .get(destination)
            .ok_or_else(|| Error::TransportUnavailable(destination.to_string()))?;
        Ok((queue.ready.len() + queue.in_flight.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unregistered_destination() {
        let queue = MemoryQueue::new(&["staging"]);
        let result = queue.enqueue("nowhere", b"x".to_vec()).await;
        assert!(matches!(result, Err(Error::TransportUnavailable(_))));
        let result = queue.depth("nowhere").await;
        assert!(matches!(result, Err(Error::TransportUnavailable(_))));
    }

    #[tokio::test]
    async fn test_rejecting_queue_fails_enqueue() {
        let queue = MemoryQueue::new(&["staging"]);
        queue.set_rejecting(true);
        let result = queue.enqueue("staging", b"x".to_vec()).await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(queue.depth("staging").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_fifo_and_ack() {
        let queue = MemoryQueue::new(&["staging"]);
        queue.enqueue("staging", b"first".to_vec()).await.unwrap();
        queue.enqueue("staging", b"second".to_vec()).await.unwrap();
        assert_eq!(queue.depth("staging").await.unwrap(), 2);

        let first = queue
            .receive("staging", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.payload, b"first");
        assert_eq!(first.delivery_count, 1);

        // Claimed but unacked messages still count.
        assert_eq!(queue.depth("staging").await.unwrap(), 2);
        queue.ack(&first).await.unwrap();
        assert_eq!(queue.depth("staging").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_receive_times_out_when_empty() {
        let queue = MemoryQueue::new(&["staging"]);
        let received = queue
            .receive("staging", Duration::from_millis(20))
            .await
            .unwrap();
        assert!(received.is_none());
    }

    #[tokio::test]
    async fn test_receive_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new(&["staging"]));
        let receiver = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.receive("staging", Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.enqueue("staging", b"late".to_vec()).await.unwrap();

        let delivery = receiver.await.unwrap().unwrap().unwrap();
        assert_eq!(delivery.payload, b"late");
    }

    #[tokio::test]
    async fn test_unacked_messages_are_redelivered() {
        let queue = MemoryQueue::new(&["finalizing"]);
        queue.enqueue("finalizing", b"once".to_vec()).await.unwrap();

        let first = queue
            .receive("finalizing", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(queue.requeue_unacked().await, 1);

        let second = queue
            .receive("finalizing", Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.delivery_count, 2);
    }
}

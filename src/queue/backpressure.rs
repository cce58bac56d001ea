//! Bounded message queue with configurable overflow handling

use crate::subprocess::Message;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{self, Instant};

use super::QueueError;

/// Strategy for handling a message that arrives while the queue is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowStrategy {
    /// Drop the arriving message
    #[default]
    DropNewest,
    /// Evict the oldest queued message to make room
    DropOldest,
    /// Wait for the consumer to make room, up to the block timeout
    Block,
    /// Reject the message with an error
    Fail,
}

/// Result of offering a message to the queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Offer {
    /// Message was queued
    Accepted,
    /// Message was queued after evicting the oldest entry
    Evicted(Message),
    /// Queue was full and the message was dropped
    Dropped,
}

/// Capacity-bounded FIFO shared between one producer and one consumer.
///
/// The producer is a stream reader task; the consumer is the batch trigger.
/// Insertion order is preserved and the length never exceeds the capacity.
#[derive(Debug)]
pub struct BoundedMessageQueue {
    buffer: Mutex<VecDeque<Message>>,
    capacity: usize,
    overflow_strategy: OverflowStrategy,
    block_timeout: Duration,
    space_available: Notify,
    dropped: AtomicU64,
}

impl BoundedMessageQueue {
    /// Create a queue. A capacity of zero is raised to one.
    pub fn new(capacity: usize, overflow_strategy: OverflowStrategy, block_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            buffer: Mutex::new(VecDeque::with_capacity(capacity.min(4096))),
            capacity,
            overflow_strategy,
            block_timeout,
            space_available: Notify::new(),
            dropped: AtomicU64::new(0),
        }
    }

    /// Queue with the default drop-newest overflow strategy
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(capacity, OverflowStrategy::DropNewest, Duration::from_secs(5))
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Message>> {
        // A panic while holding the lock cannot leave the deque half-modified
        self.buffer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Queue the message if there is room. Never blocks.
    pub fn try_enqueue(&self, message: Message) -> bool {
        let mut buffer = self.lock();
        if buffer.len() >= self.capacity {
            return false;
        }
        buffer.push_back(message);
        true
    }

    /// Queue the message, applying the overflow strategy when full
    pub async fn offer(&self, message: Message) -> Result<Offer, QueueError> {
        let message = match self.offer_now(message) {
            Ok(offer) => return offer,
            Err(message) => message,
        };
        self.wait_for_space(message).await
    }

    /// Apply every strategy that does not wait. Hands the message back when
    /// the caller has to block for space.
    fn offer_now(&self, message: Message) -> Result<Result<Offer, QueueError>, Message> {
        let mut buffer = self.lock();

        if buffer.len() < self.capacity {
            buffer.push_back(message);
            return Ok(Ok(Offer::Accepted));
        }

        match self.overflow_strategy {
            OverflowStrategy::DropOldest => {
                let evicted = buffer.pop_front();
                buffer.push_back(message);
                drop(buffer);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(capacity = self.capacity, "Queue overflow: dropped oldest message");
                Ok(Ok(evicted.map_or(Offer::Accepted, Offer::Evicted)))
            }
            OverflowStrategy::DropNewest => {
                drop(buffer);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(capacity = self.capacity, "Queue overflow: dropped newest message");
                Ok(Ok(Offer::Dropped))
            }
            OverflowStrategy::Fail => {
                drop(buffer);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                Ok(Err(QueueError::Full {
                    capacity: self.capacity,
                }))
            }
            OverflowStrategy::Block => Err(message),
        }
    }

    async fn wait_for_space(&self, message: Message) -> Result<Offer, QueueError> {
        let deadline = Instant::now() + self.block_timeout;
        loop {
            // Register interest before checking so a drain in between is not missed
            let notified = self.space_available.notified();
            {
                let mut buffer = self.lock();
                if buffer.len() < self.capacity {
                    buffer.push_back(message);
                    return Ok(Offer::Accepted);
                }
            }

            if time::timeout_at(deadline, notified).await.is_err() {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return Err(QueueError::Timeout {
                    capacity: self.capacity,
                    waited: self.block_timeout,
                });
            }
        }
    }

    /// Remove up to `max` messages from the front, in arrival order
    pub fn drain(&self, max: usize) -> Vec<Message> {
        let mut buffer = self.lock();
        let count = max.min(buffer.len());
        let drained: Vec<Message> = buffer.drain(..count).collect();
        drop(buffer);

        if !drained.is_empty() {
            self.space_available.notify_waiters();
        }
        drained
    }

    /// Remove every queued message
    pub fn drain_all(&self) -> Vec<Message> {
        self.drain(usize::MAX)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn overflow_strategy(&self) -> OverflowStrategy {
        self.overflow_strategy
    }

    /// Messages lost to overflow since the queue was created
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

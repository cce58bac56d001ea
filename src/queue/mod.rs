//! Queues shared between the stream readers and the batch trigger
//!
//! Stdout messages go through a [`BoundedMessageQueue`] whose overflow
//! behaviour is configurable. Stderr fragments go through a small
//! [`ErrorBuffer`] that is drained in full on every trigger.

pub mod backpressure;
pub mod error_buffer;

pub use backpressure::{BoundedMessageQueue, Offer, OverflowStrategy};
pub use error_buffer::{ErrorBuffer, DEFAULT_ERROR_BUFFER_SIZE};

use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("message queue full (capacity {capacity}), message rejected")]
    Full { capacity: usize },

    #[error("message queue full (capacity {capacity}), no space after waiting {waited:?}")]
    Timeout { capacity: usize, waited: Duration },
}

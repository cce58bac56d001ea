//! Bounded buffer of raw stderr fragments

use super::backpressure::{BoundedMessageQueue, OverflowStrategy};
use crate::subprocess::Message;
use std::time::Duration;

/// Fragments kept between two triggers before further stderr output is dropped
pub const DEFAULT_ERROR_BUFFER_SIZE: usize = 20;

/// Holds stderr output until the next trigger collects it.
///
/// Fragments are not delimiter framed; a drain concatenates them in arrival order.
#[derive(Debug)]
pub struct ErrorBuffer {
    fragments: BoundedMessageQueue,
}

impl Default for ErrorBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_BUFFER_SIZE)
    }
}

impl ErrorBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            fragments: BoundedMessageQueue::new(
                capacity,
                OverflowStrategy::DropNewest,
                Duration::ZERO,
            ),
        }
    }

    /// Store a fragment. Returns false if the buffer was full and it was dropped.
    pub fn push(&self, fragment: Message) -> bool {
        let accepted = self.fragments.try_enqueue(fragment);
        if !accepted {
            tracing::debug!(
                capacity = self.fragments.capacity(),
                "Error buffer full, dropping stderr fragment"
            );
        }
        accepted
    }

    /// Record a diagnostic produced by this process rather than the subprocess
    pub fn push_text(&self, text: impl Into<String>) -> bool {
        self.push(Message::from(text.into()))
    }

    /// Remove every fragment and join them into one string.
    ///
    /// Returns an empty string when nothing was buffered.
    pub fn drain_to_string(&self) -> String {
        let mut bytes = Vec::new();
        for fragment in self.fragments.drain_all() {
            bytes.extend_from_slice(fragment.as_bytes());
        }
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn len(&self) -> usize {
        self.fragments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fragments.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.fragments.capacity()
    }
}

//! Stream reader tasks feeding the framer and the queues
//!
//! One task per pipe. Reads never wait on the batch trigger; the only
//! coupling between the two sides is the bounded queue.

use super::framer::{fragment, Message, RawChunk, StreamFramer};
use super::policy::{StdinAction, StdinPolicy};
use super::supervisor::StdinSlot;
use crate::queue::{BoundedMessageQueue, ErrorBuffer, Offer};
use std::io;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

pub const DEFAULT_READ_BUFFER_SIZE: usize = 8192;

/// Counters reported by a reader task when its stream closes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReaderStats {
    pub bytes: u64,
    pub messages: u64,
    pub dropped: u64,
}

async fn read_chunk<R>(reader: &mut R, buf: &mut [u8], stream: &'static str) -> (usize, bool)
where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.read(buf).await {
            Ok(0) => return (0, true),
            Ok(n) => return (n, false),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(stream, error = %e, "Read failed, treating stream as closed");
                return (0, true);
            }
        }
    }
}

/// Read stdout until it closes, framing messages into `queue`.
///
/// Messages the overflow strategy rejects are reported through `errors`
/// so the next trigger fails instead of losing them silently.
pub async fn pump_stdout<R>(
    mut reader: R,
    mut framer: StreamFramer,
    queue: Arc<BoundedMessageQueue>,
    errors: Arc<ErrorBuffer>,
    read_buffer_size: usize,
) -> ReaderStats
where
    R: AsyncRead + Unpin,
{
    let mut stats = ReaderStats::default();
    let mut buf = vec![0u8; read_buffer_size.max(1)];

    loop {
        let (n, closed) = read_chunk(&mut reader, &mut buf, "stdout").await;
        stats.bytes += n as u64;
        let chunk = if closed {
            RawChunk::closed(&buf[..n])
        } else {
            RawChunk::open(&buf[..n])
        };

        for message in framer.feed(chunk) {
            tracing::trace!(len = message.len(), "Framed stdout message");
            match queue.offer(message).await {
                Ok(Offer::Accepted) => stats.messages += 1,
                Ok(Offer::Evicted(_)) => {
                    stats.messages += 1;
                    stats.dropped += 1;
                }
                Ok(Offer::Dropped) => stats.dropped += 1,
                Err(e) => {
                    stats.dropped += 1;
                    tracing::warn!(error = %e, "Rejected stdout message");
                    errors.push_text(format!("{e}\n"));
                }
            }
        }

        if closed {
            break;
        }
    }

    tracing::debug!(
        bytes = stats.bytes,
        messages = stats.messages,
        dropped = stats.dropped,
        "Stdout closed"
    );
    stats
}

/// Read stderr until it closes, buffering each read as one fragment.
///
/// Every fragment is shown to `policy`, which may close the subprocess's stdin.
pub async fn pump_stderr<R>(
    mut reader: R,
    errors: Arc<ErrorBuffer>,
    policy: Arc<dyn StdinPolicy>,
    stdin: StdinSlot,
    read_buffer_size: usize,
) -> ReaderStats
where
    R: AsyncRead + Unpin,
{
    let mut stats = ReaderStats::default();
    let mut buf = vec![0u8; read_buffer_size.max(1)];

    loop {
        let (n, closed) = read_chunk(&mut reader, &mut buf, "stderr").await;
        stats.bytes += n as u64;

        if let Some(message) = fragment(RawChunk::open(&buf[..n])) {
            tracing::warn!(
                text = %String::from_utf8_lossy(message.as_bytes()).trim_end(),
                "Subprocess wrote to stderr"
            );
            let action = policy.on_stderr(message.as_bytes());
            record(&errors, message, &mut stats);
            if action == StdinAction::Close && stdin.close() {
                tracing::debug!("Closed subprocess stdin after stderr output");
            }
        }

        if closed {
            break;
        }
    }

    tracing::debug!(bytes = stats.bytes, fragments = stats.messages, "Stderr closed");
    stats
}

fn record(errors: &ErrorBuffer, message: Message, stats: &mut ReaderStats) {
    if errors.push(message) {
        stats.messages += 1;
    } else {
        stats.dropped += 1;
    }
}

//! Delimiter framing for raw subprocess output
//!
//! Subprocess pipes deliver bytes in arbitrarily sized reads. A single read can
//! hold half a message, several messages, or end right on a delimiter. The
//! [`StreamFramer`] turns that sequence of reads back into complete messages,
//! carrying any undelimited tail over to the next read.

use std::fmt;

/// Default byte that terminates a message on stdout.
pub const DEFAULT_DELIMITER: u8 = b'\n';

/// One read from a subprocess stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawChunk<'a> {
    /// Bytes delivered by this read
    pub bytes: &'a [u8],
    /// Whether the source stream has reached end-of-file
    pub closed: bool,
}

impl<'a> RawChunk<'a> {
    /// A chunk read from a stream that is still open
    pub fn open(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            closed: false,
        }
    }

    /// The final chunk of a stream
    pub fn closed(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            closed: true,
        }
    }
}

/// One complete unit of subprocess output with its delimiter removed.
#[derive(Clone, PartialEq, Eq, Hash, Default)]
pub struct Message(Vec<u8>);

impl Message {
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Message content as text, replacing invalid UTF-8 sequences
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.0).into_owned()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Message")
            .field(&String::from_utf8_lossy(&self.0))
            .finish()
    }
}

impl From<&str> for Message {
    fn from(s: &str) -> Self {
        Self(s.as_bytes().to_vec())
    }
}

impl From<String> for Message {
    fn from(s: String) -> Self {
        Self(s.into_bytes())
    }
}

impl From<Vec<u8>> for Message {
    fn from(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }
}

/// What to do with undelimited bytes still buffered when the stream closes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailingPolicy {
    /// Drop the partial message
    #[default]
    Discard,
    /// Emit the partial message as a final message
    Flush,
}

/// Framing options for a stdout stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramerConfig {
    pub delimiter: u8,
    /// Remove one `\r` immediately before a `\n` delimiter
    pub strip_carriage_return: bool,
    pub trailing: TrailingPolicy,
}

impl Default for FramerConfig {
    fn default() -> Self {
        Self {
            delimiter: DEFAULT_DELIMITER,
            strip_carriage_return: true,
            trailing: TrailingPolicy::Discard,
        }
    }
}

/// Reassembles delimiter-terminated messages from a fragmented byte stream.
///
/// The only state is the accumulation buffer: after every chunk it holds
/// exactly the bytes seen since the last delimiter.
#[derive(Debug, Default)]
pub struct StreamFramer {
    config: FramerConfig,
    pending: Vec<u8>,
}

impl StreamFramer {
    pub fn new(config: FramerConfig) -> Self {
        Self {
            config,
            pending: Vec::with_capacity(4096),
        }
    }

    pub fn config(&self) -> &FramerConfig {
        &self.config
    }

    /// Bytes received since the last delimiter
    pub fn pending(&self) -> &[u8] {
        &self.pending
    }

    /// Frame one chunk.
    ///
    /// Messages are produced lazily as the returned iterator is advanced.
    /// Dropping the iterator before it is exhausted still consumes the whole
    /// chunk; messages not yet yielded are lost.
    pub fn feed<'f, 'c>(&'f mut self, chunk: RawChunk<'c>) -> Frames<'f, 'c> {
        Frames {
            framer: self,
            rest: chunk.bytes,
            closed: chunk.closed,
            done: false,
        }
    }

    /// Frame one chunk and collect every message it completes
    pub fn feed_all(&mut self, chunk: RawChunk<'_>) -> Vec<Message> {
        self.feed(chunk).collect()
    }

    fn take_message(&mut self) -> Message {
        let mut bytes = std::mem::take(&mut self.pending);
        if self.config.strip_carriage_return
            && self.config.delimiter == b'\n'
            && bytes.last() == Some(&b'\r')
        {
            bytes.pop();
        }
        self.pending = Vec::with_capacity(bytes.capacity().min(4096));
        Message(bytes)
    }
}

/// Lazy sequence of messages completed by one chunk.
///
/// Created by [`StreamFramer::feed`].
pub struct Frames<'f, 'c> {
    framer: &'f mut StreamFramer,
    rest: &'c [u8],
    closed: bool,
    done: bool,
}

impl Iterator for Frames<'_, '_> {
    type Item = Message;

    fn next(&mut self) -> Option<Message> {
        if self.done {
            return None;
        }

        let delimiter = self.framer.config.delimiter;
        if let Some(pos) = self.rest.iter().position(|b| *b == delimiter) {
            self.framer.pending.extend_from_slice(&self.rest[..pos]);
            self.rest = &self.rest[pos + 1..];
            return Some(self.framer.take_message());
        }

        self.framer.pending.extend_from_slice(self.rest);
        self.rest = &[];
        self.done = true;

        if self.closed && !self.framer.pending.is_empty() {
            match self.framer.config.trailing {
                TrailingPolicy::Flush => return Some(self.framer.take_message()),
                TrailingPolicy::Discard => {
                    tracing::debug!(
                        bytes = self.framer.pending.len(),
                        "Discarding undelimited trailing output on stream close"
                    );
                    self.framer.pending.clear();
                }
            }
        }
        None
    }
}

impl Drop for Frames<'_, '_> {
    fn drop(&mut self) {
        // Keep the framer state consistent with the full chunk
        while self.next().is_some() {}
    }
}

/// Turn one stderr read into a fragment without delimiter search.
///
/// Empty reads produce nothing.
pub fn fragment(chunk: RawChunk<'_>) -> Option<Message> {
    if chunk.bytes.is_empty() {
        None
    } else {
        Some(Message(chunk.bytes.to_vec()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn strings(messages: &[Message]) -> Vec<String> {
        messages.iter().map(Message::to_string_lossy).collect()
    }

    #[test]
    fn test_single_message_in_one_chunk() {
        let mut framer = StreamFramer::default();
        let messages = framer.feed_all(RawChunk::open(b"Message 1\n"));
        assert_eq!(strings(&messages), vec!["Message 1"]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn test_multiple_messages_in_one_chunk() {
        let mut framer = StreamFramer::default();
        let messages = framer.feed_all(RawChunk::open(b"Message 1\nMessage 2\nMessage 3\n"));
        assert_eq!(
            strings(&messages),
            vec!["Message 1", "Message 2", "Message 3"]
        );
    }

    #[test]
    fn test_partial_message_carried_across_chunks() {
        let mut framer = StreamFramer::default();
        assert!(framer
            .feed_all(RawChunk::open(b"Message part 1, "))
            .is_empty());
        assert_eq!(framer.pending(), b"Message part 1, ");

        let messages = framer.feed_all(RawChunk::open(b"Message part 2\n"));
        assert_eq!(strings(&messages), vec!["Message part 1, Message part 2"]);
    }

    #[test]
    fn test_trailing_bytes_retained_after_last_delimiter() {
        let mut framer = StreamFramer::default();
        let messages = framer.feed_all(RawChunk::open(b"a\nb\nc"));
        assert_eq!(strings(&messages), vec!["a", "b"]);
        assert_eq!(framer.pending(), b"c");
    }

    #[test]
    fn test_empty_chunks_are_harmless() {
        let mut framer = StreamFramer::default();
        assert!(framer.feed_all(RawChunk::open(b"")).is_empty());
        framer.feed_all(RawChunk::open(b"abc"));
        assert!(framer.feed_all(RawChunk::open(b"")).is_empty());
        assert_eq!(framer.pending(), b"abc");
    }

    #[test]
    fn test_split_exactly_at_delimiter() {
        let mut framer = StreamFramer::default();
        assert!(framer.feed_all(RawChunk::open(b"hello")).is_empty());
        let messages = framer.feed_all(RawChunk::open(b"\n"));
        assert_eq!(strings(&messages), vec!["hello"]);
    }

    #[test]
    fn test_empty_lines_become_empty_messages() {
        let mut framer = StreamFramer::default();
        let messages = framer.feed_all(RawChunk::open(b"\n\nx\n"));
        assert_eq!(strings(&messages), vec!["", "", "x"]);
    }

    #[test]
    fn test_carriage_return_stripped_before_newline() {
        let mut framer = StreamFramer::default();
        let messages = framer.feed_all(RawChunk::open(b"one\r\ntwo\r"));
        assert_eq!(strings(&messages), vec!["one"]);
        let messages = framer.feed_all(RawChunk::open(b"\n"));
        assert_eq!(strings(&messages), vec!["two"]);
    }

    #[test]
    fn test_carriage_return_kept_when_disabled() {
        let mut framer = StreamFramer::new(FramerConfig {
            strip_carriage_return: false,
            ..FramerConfig::default()
        });
        let messages = framer.feed_all(RawChunk::open(b"one\r\n"));
        assert_eq!(messages[0].as_bytes(), b"one\r");
    }

    #[test]
    fn test_custom_delimiter() {
        let mut framer = StreamFramer::new(FramerConfig {
            delimiter: b'|',
            ..FramerConfig::default()
        });
        let messages = framer.feed_all(RawChunk::open(b"a|b\n|c"));
        assert_eq!(strings(&messages), vec!["a", "b\n"]);
        assert_eq!(framer.pending(), b"c");
    }

    #[test]
    fn test_trailing_partial_discarded_on_close_by_default() {
        let mut framer = StreamFramer::default();
        let messages = framer.feed_all(RawChunk::closed(b"done\nunterminated"));
        assert_eq!(strings(&messages), vec!["done"]);
        assert!(framer.pending().is_empty());
    }

    #[test]
    fn test_trailing_partial_flushed_when_configured() {
        let mut framer = StreamFramer::new(FramerConfig {
            trailing: TrailingPolicy::Flush,
            ..FramerConfig::default()
        });
        framer.feed_all(RawChunk::open(b"unter"));
        let messages = framer.feed_all(RawChunk::closed(b"minated"));
        assert_eq!(strings(&messages), vec!["unterminated"]);
    }

    #[test]
    fn test_close_with_empty_buffer_emits_nothing() {
        let mut framer = StreamFramer::new(FramerConfig {
            trailing: TrailingPolicy::Flush,
            ..FramerConfig::default()
        });
        assert_eq!(
            strings(&framer.feed_all(RawChunk::closed(b"x\n"))),
            vec!["x"]
        );
    }

    #[test]
    fn test_frames_are_lazy() {
        let mut framer = StreamFramer::default();
        let mut frames = framer.feed(RawChunk::open(b"a\nb\n"));
        assert_eq!(frames.next(), Some(Message::from("a")));
        assert_eq!(frames.next(), Some(Message::from("b")));
        assert_eq!(frames.next(), None);
        assert_eq!(frames.next(), None);
    }

    #[test]
    fn test_dropping_frames_early_keeps_state_consistent() {
        let mut framer = StreamFramer::default();
        {
            let mut frames = framer.feed(RawChunk::open(b"a\nb\ntail"));
            assert_eq!(frames.next(), Some(Message::from("a")));
        }
        assert_eq!(framer.pending(), b"tail");
    }

    #[test]
    fn test_fragment_ignores_empty_reads() {
        assert_eq!(fragment(RawChunk::open(b"")), None);
        assert_eq!(
            fragment(RawChunk::open(b"Traceback\n")),
            Some(Message::from("Traceback\n"))
        );
    }

    fn split_at_points(data: &[u8], mut points: Vec<usize>) -> Vec<&[u8]> {
        points.sort_unstable();
        points.dedup();
        let mut chunks = Vec::new();
        let mut start = 0;
        for p in points.into_iter().filter(|p| *p <= data.len()) {
            chunks.push(&data[start..p]);
            start = p;
        }
        chunks.push(&data[start..]);
        chunks
    }

    proptest! {
        #[test]
        fn prop_framing_is_chunk_boundary_invariant(
            lines in prop::collection::vec("[a-z0-9 ,]{0,12}", 0..12),
            tail in "[a-z]{0,5}",
            cuts in prop::collection::vec(0usize..200, 0..16),
        ) {
            let mut data = Vec::new();
            for line in &lines {
                data.extend_from_slice(line.as_bytes());
                data.push(b'\n');
            }
            data.extend_from_slice(tail.as_bytes());

            let mut whole = StreamFramer::default();
            let expected = whole.feed_all(RawChunk::open(&data));

            let mut pieces = StreamFramer::default();
            let mut actual = Vec::new();
            for chunk in split_at_points(&data, cuts) {
                actual.extend(pieces.feed(RawChunk::open(chunk)));
            }

            prop_assert_eq!(strings(&actual), lines.clone());
            prop_assert_eq!(actual, expected);
            prop_assert_eq!(pieces.pending(), tail.as_bytes());
        }

        #[test]
        fn prop_single_trailing_delimiter_yields_one_message(
            body in "[^\n\r]{0,40}",
            cuts in prop::collection::vec(0usize..64, 0..8),
        ) {
            let mut data = body.clone().into_bytes();
            data.push(b'\n');

            let mut framer = StreamFramer::default();
            let mut messages = Vec::new();
            for chunk in split_at_points(&data, cuts) {
                messages.extend(framer.feed(RawChunk::open(chunk)));
            }

            prop_assert_eq!(messages.len(), 1);
            prop_assert_eq!(messages[0].as_bytes(), body.as_bytes());
        }

        #[test]
        fn prop_k_delimiters_yield_k_messages(
            parts in prop::collection::vec("[a-z]{0,6}", 1..10),
        ) {
            let joined = parts.join("\n");
            let k = parts.len() - 1;

            let mut framer = StreamFramer::default();
            let messages = framer.feed_all(RawChunk::open(joined.as_bytes()));

            prop_assert_eq!(messages.len(), k);
            prop_assert_eq!(framer.pending(), parts[k].as_bytes());
        }
    }
}

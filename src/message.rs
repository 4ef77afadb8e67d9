//! Byte collections with efficient operations for segment processing.
//!
//! This module primarily implements the [`Message`] collection, the buffer
//! type that carries segment payloads through the send queue, the
//! retransmission queue and the receive side.

use std::{
    collections::VecDeque,
    fmt::Display,
    ops::{Bound, RangeBounds},
};

mod chunk;
pub use chunk::Chunk;

/// A byte collection with cheap sharing, trimming and header prepending.
///
/// Retransmission keeps a copy of every unacknowledged segment and the
/// receive path trims overlapping bytes off buffered segments. Both have to
/// be cheap, so bytes are never copied: a message is a list of views into
/// reference-counted chunks.
#[derive(Debug, Clone, Default)]
pub struct Message {
    chunks: VecDeque<Chunk>,
    len: usize,
}

impl Message {
    /// Creates a new message with the given body content.
    ///
    /// # Examples
    ///
    /// ```
    /// # use elvis_tcp::message::Message;
    /// let message = Message::new(b"Body");
    /// assert_eq!(message.len(), 4);
    /// ```
    pub fn new(body: impl Into<Chunk>) -> Self {
        let body = body.into();
        let len = body.len();
        let mut chunks = VecDeque::new();
        if len > 0 {
            chunks.push_back(body);
        }
        Self { chunks, len }
    }

    /// Prepends a header to the message.
    ///
    /// # Examples
    ///
    /// ```
    /// # use elvis_tcp::message::Message;
    /// let mut message = Message::new(b"Body");
    /// message.prepend(b"Header");
    /// assert_eq!(message.to_vec(), b"HeaderBody");
    /// ```
    pub fn prepend(&mut self, header: impl Into<Chunk>) {
        let header = header.into();
        if header.is_empty() {
            return;
        }
        self.len += header.len();
        self.chunks.push_front(header);
    }

    /// Adds the given message to the end of this one.
    pub fn append(&mut self, other: Message) {
        self.len += other.len;
        self.chunks.extend(other.chunks);
    }

    /// Returns a message sharing the bytes of `range` with this one. All Rust
    /// range types defined in std::ops are supported.
    ///
    /// # Examples
    ///
    /// ```
    /// # use elvis_tcp::message::Message;
    /// let mut message = Message::new(b"Body");
    /// message.prepend(b"Header");
    /// assert_eq!(message.share(3..8).to_vec(), b"derBo");
    /// ```
    pub fn share(&self, range: impl RangeBounds<usize>) -> Self {
        let mut shared = self.clone();
        shared.slice(range);
        shared
    }

    /// Narrows the message to the given range.
    pub fn slice(&mut self, range: impl RangeBounds<usize>) {
        let start = match range.start_bound() {
            Bound::Included(&start) => start,
            Bound::Excluded(&start) => start + 1,
            Bound::Unbounded => 0,
        };
        let end = match range.end_bound() {
            Bound::Included(&end) => end + 1,
            Bound::Excluded(&end) => end,
            Bound::Unbounded => self.len,
        };
        assert!(start <= end && end <= self.len);
        self.trim_back(self.len - end);
        self.trim_front(start);
    }

    /// Removes the first `len` bytes from the message and returns them as a new
    /// message.
    pub fn cut(&mut self, len: usize) -> Self {
        assert!(len <= self.len);
        self.len -= len;

        let mut chunks = VecDeque::new();
        let mut to_remove = len;

        while to_remove > 0 {
            let Some(mut head) = self.chunks.pop_front() else {
                break;
            };
            let head_len = head.len();
            if head_len <= to_remove {
                to_remove -= head_len;
                chunks.push_back(head);
            } else {
                let mut front = head.clone();
                front.end = front.start + to_remove;
                chunks.push_back(front);
                head.start += to_remove;
                self.chunks.push_front(head);
                to_remove = 0;
            }
        }

        Self { chunks, len }
    }

    /// Drops the first `len` bytes.
    pub fn trim_front(&mut self, len: usize) {
        assert!(len <= self.len);
        self.len -= len;

        let mut to_remove = len;
        while let Some(head) = self.chunks.front_mut() {
            let head_len = head.len();
            if head_len <= to_remove {
                to_remove -= head_len;
                self.chunks.pop_front();
            } else {
                head.start += to_remove;
                break;
            }
        }
    }

    /// Drops the last `len` bytes.
    pub fn trim_back(&mut self, len: usize) {
        assert!(len <= self.len);
        self.len -= len;

        let mut to_remove = len;
        while let Some(tail) = self.chunks.back_mut() {
            let tail_len = tail.len();
            if tail_len <= to_remove {
                to_remove -= tail_len;
                self.chunks.pop_back();
            } else {
                tail.end -= to_remove;
                break;
            }
        }
    }

    /// The length of the message.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether the message contains no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The number of chunks backing the message.
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    /// Returns an iterator over the bytes of the entire message.
    pub fn iter(&self) -> impl Iterator<Item = u8> + '_ {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.as_slice().iter().copied())
    }

    pub fn to_vec(&self) -> Vec<u8> {
        self.iter().collect()
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:x} ")?;
        }
        Ok(())
    }
}

impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.len == other.len && self.iter().eq(other.iter())
    }
}

impl Eq for Message {}

impl From<Vec<u8>> for Message {
    fn from(val: Vec<u8>) -> Self {
        Message::new(val)
    }
}

impl From<&[u8]> for Message {
    fn from(val: &[u8]) -> Self {
        Message::new(val)
    }
}

impl<const L: usize> From<[u8; L]> for Message {
    fn from(val: [u8; L]) -> Self {
        Message::new(val)
    }
}

impl<const L: usize> From<&[u8; L]> for Message {
    fn from(val: &[u8; L]) -> Self {
        Message::new(val)
    }
}

impl From<&str> for Message {
    fn from(val: &str) -> Self {
        Message::new(val)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_message() {
        let body = b"body";
        let message = Message::new(body);
        assert_eq!(message.len(), body.len());
        assert_eq!(&message.to_vec(), body);
    }

    #[test]
    fn share_leaves_original_untouched() {
        let message = Message::new("payload");
        let shared = message.share(3..);
        assert_eq!(&shared.to_vec(), b"load");
        assert_eq!(&message.to_vec(), b"payload");
    }

    #[test]
    fn share_across_header() {
        let mut message = Message::new(b"Body");
        message.prepend(b"Header");
        let shared = message.share(3..8).share(2..4);
        assert_eq!(&shared.to_vec(), b"rB");
    }

    #[test]
    fn prepend_after_trim() {
        let mut message = Message::new(b"Hello, world");
        message.trim_front(7);
        message.prepend(b"Header ");
        assert_eq!(&message.to_vec(), b"Header world");
    }

    #[test]
    fn trim_back_spans_chunks() {
        let mut message = Message::new("abc");
        message.append(Message::new("def"));
        message.append(Message::new("ghi"));
        message.trim_back(5);
        assert_eq!(message.len(), 4);
        assert_eq!(&message.to_vec(), b"abcd");
        assert_eq!(message.chunk_count(), 2);
    }

    #[test]
    fn trim_everything() {
        let mut message = Message::new(b"body");
        message.trim_front(4);
        assert!(message.is_empty());
        assert_eq!(message.chunk_count(), 0);
    }

    #[test]
    fn append() {
        let mut message = Message::new("Hello");
        message.append(Message::new(" world!"));
        assert_eq!(&message.to_vec(), b"Hello world!");
    }

    #[test]
    fn empty_message_has_no_chunks() {
        let message = Message::new("");
        assert_eq!(message.chunk_count(), 0);
        assert_eq!(&message.to_vec(), b"");
    }

    #[test]
    fn cut() {
        let mut a = Message::new("Hello, world");
        let b = a.cut(5);
        assert_eq!(a, Message::new(", world"));
        assert_eq!(b, Message::new("Hello"));
    }

    #[test]
    fn cut_more_complex() {
        let mut a = Message::new("stuffa");
        a.prepend(" and ");
        a.prepend("athings");
        a.slice(1..);
        a.slice(..16);
        let b = a.cut(10);
        assert_eq!(a, Message::new(" stuff"));
        assert_eq!(b, Message::new("things and"));
    }

    #[test]
    fn trim_front_more_complex() {
        let mut a = Message::new("stuffa");
        a.prepend(" and ");
        a.prepend("athings");
        a.slice(1..);
        a.slice(..16);
        a.trim_front(10);
        assert_eq!(a, Message::new(" stuff"));
    }
}

use crate::{message::Message, tcp::seq::SeqNumber};
use std::collections::BTreeMap;

/// Out-of-order segments keyed by their first sequence number.
///
/// Stored ranges never overlap. Every key lies within one receive window of
/// RCV.NXT, which keeps the wrapping sequence order total over the keys.
#[derive(Debug, Default)]
pub struct Reassembly {
    segments: BTreeMap<SeqNumber, Message>,
}

impl Reassembly {
    /// Stores the bytes of `text` not already held, as they arrived.
    pub fn insert(&mut self, seq: SeqNumber, text: Message) {
        if text.is_empty() {
            return;
        }
        let end = seq + text.len() as u32;
        let mut cursor = seq;
        let mut gaps = vec![];
        for (&start, held) in self.segments.iter() {
            let held_end = start + held.len() as u32;
            if held_end <= cursor {
                continue;
            }
            if start >= end {
                break;
            }
            if start > cursor {
                gaps.push((cursor, start));
            }
            cursor = cursor.max(held_end);
        }
        if cursor < end {
            gaps.push((cursor, end));
        }
        for (start, stop) in gaps {
            let from = (start - seq) as usize;
            let to = (stop - seq) as usize;
            self.segments.insert(start, text.share(from..to));
        }
    }

    /// Removes the data contiguous with `rcv_nxt`, trimming what was already
    /// received and discarding segments wholly below it. Returns the data in
    /// order, empty when the gap is still open.
    pub fn merge(&mut self, mut rcv_nxt: SeqNumber) -> Message {
        let mut merged = Message::default();
        while let Some(entry) = self.segments.first_entry() {
            let start = *entry.key();
            let end = start + entry.get().len() as u32;
            if start > rcv_nxt {
                break;
            }
            let mut text = entry.remove();
            if end <= rcv_nxt {
                continue;
            }
            text.trim_front((rcv_nxt - start) as usize);
            rcv_nxt = end;
            merged.append(text);
        }
        merged
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The number of stored segments.
    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn clear(&mut self) {
        self.segments.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(n: u32) -> SeqNumber {
        SeqNumber::new(n)
    }

    #[test]
    fn merges_when_gap_closes() {
        let mut reassembly = Reassembly::default();
        reassembly.insert(seq(20), "cccccccccc".into());
        reassembly.insert(seq(10), "bbbbbbbbbb".into());
        reassembly.insert(seq(30), "dddddddddd".into());
        assert_eq!(reassembly.len(), 3);

        assert!(reassembly.merge(seq(5)).is_empty());
        let merged = reassembly.merge(seq(10));
        assert_eq!(merged.len(), 30);
        assert_eq!(&merged.to_vec()[..12], b"bbbbbbbbbbcc");
        assert!(reassembly.is_empty());
    }

    #[test]
    fn keeps_only_new_bytes_of_overlaps() {
        let mut reassembly = Reassembly::default();
        reassembly.insert(seq(10), "0123456789".into());
        // Overlaps both ends of the held segment
        reassembly.insert(seq(5), "abcdefghijklmnopqrst".into());
        assert_eq!(reassembly.len(), 3);

        let merged = reassembly.merge(seq(5));
        assert_eq!(merged.to_vec(), b"abcde0123456789pqrst");
    }

    #[test]
    fn trims_and_discards_old_data() {
        let mut reassembly = Reassembly::default();
        reassembly.insert(seq(0), "old".into());
        reassembly.insert(seq(8), "abcd".into());
        let merged = reassembly.merge(seq(10));
        assert_eq!(merged.to_vec(), b"cd");
        assert!(reassembly.is_empty());
    }

    #[test]
    fn handles_wraparound() {
        let mut reassembly = Reassembly::default();
        reassembly.insert(seq(2), "cd".into());
        reassembly.insert(seq(u32::MAX - 1), "wxyz".into());
        let merged = reassembly.merge(seq(u32::MAX - 1));
        assert_eq!(merged.to_vec(), b"wxyzcd");
    }
}

//! User message reassembly
//!
//! Fragments are grouped by [`FragmentKey`] and ordered by their sequence
//! number: the TSN for DATA, the fragment sequence number for I-DATA.
//! Numbers are compared modulo 2^32, so a message may straddle the wrap.
//! A reassembled message stays registered for the session so late
//! duplicates and replays can be answered.

use crate::types::FrameId;
use bytes::{Bytes, BytesMut};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, trace};

/// Identifies the fragments of one user message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct FragmentKey {
    pub source_port: u16,
    pub destination_port: u16,
    pub vtag: u32,
    pub stream_id: u16,
    /// Stream sequence number (DATA) or message identifier (I-DATA)
    pub sequence: u32,
    pub unordered: bool,
}

#[derive(Debug, Clone)]
pub struct Fragment {
    pub tsn: u32,
    pub frame: FrameId,
    pub length: usize,
    pub begin: bool,
    pub end: bool,
    /// Dropped once consumed into a [`CompleteMessage`]
    payload: Option<Bytes>,
}

impl Fragment {
    pub fn is_consumed(&self) -> bool {
        self.payload.is_none()
    }
}

/// A reassembled message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompleteMessage {
    /// First sequence number of the span
    pub begin: u32,
    /// Last sequence number; lower than `begin` when the span wraps
    pub end: u32,
    /// Frame whose fragment completed the message
    pub completed_in: FrameId,
    /// Frames that carried the fragments, in sequence order
    pub frames: Vec<FrameId>,
    pub data: Bytes,
}

impl CompleteMessage {
    pub fn contains(&self, tsn: u32) -> bool {
        if self.begin <= self.end {
            tsn >= self.begin && tsn <= self.end
        } else {
            tsn >= self.begin || tsn <= self.end
        }
    }
}

/// Fragments sharing one key
#[derive(Debug, Clone, Default)]
pub struct FragmentedMessage {
    /// Begin markers, descending
    begins: Vec<u32>,
    /// End markers, ascending
    ends: Vec<u32>,
    fragments: BTreeMap<u32, Fragment>,
    completed: Vec<CompleteMessage>,
}

impl FragmentedMessage {
    pub fn fragment(&self, tsn: u32) -> Option<&Fragment> {
        self.fragments.get(&tsn)
    }

    pub fn completed(&self) -> &[CompleteMessage] {
        &self.completed
    }

    /// Nearest begin at or before `tsn` and nearest end at or after it,
    /// provided every sequence number in between is present, unconsumed and
    /// free of other message boundaries.
    fn bounding_run(&self, tsn: u32) -> Option<(u32, u32)> {
        let begin = self
            .begins
            .iter()
            .copied()
            .min_by_key(|begin| tsn.wrapping_sub(*begin))?;
        let end = self
            .ends
            .iter()
            .copied()
            .min_by_key(|end| end.wrapping_sub(tsn))?;
        if tsn.wrapping_sub(begin) > end.wrapping_sub(begin) {
            return None;
        }

        let mut current = begin;
        loop {
            let fragment = self.fragments.get(&current)?;
            if fragment.is_consumed() || (current != begin && fragment.begin) {
                return None;
            }
            if current == end {
                return Some((begin, end));
            }
            if fragment.end {
                return None;
            }
            current = current.wrapping_add(1);
        }
    }

    fn assemble(&mut self, begin: u32, end: u32, frame: FrameId) -> CompleteMessage {
        let mut data = BytesMut::new();
        let mut frames = Vec::new();

        let mut current = begin;
        loop {
            if let Some(fragment) = self.fragments.get_mut(&current) {
                if let Some(payload) = fragment.payload.take() {
                    data.extend_from_slice(&payload);
                }
                frames.push(fragment.frame);
            }
            if current == end {
                break;
            }
            current = current.wrapping_add(1);
        }
        frames.dedup();

        self.begins.retain(|b| *b != begin);
        self.ends.retain(|e| *e != end);

        let message = CompleteMessage {
            begin,
            end,
            completed_in: frame,
            frames,
            data: data.freeze(),
        };
        self.completed.push(message.clone());
        message
    }
}

/// Result of [`FragmentReassembler::add_fragment`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FragmentAdd {
    Added,
    /// Same fragment from the same frame; nothing changed
    AlreadyPresent,
    /// Another frame already supplied this sequence number
    Duplicate { original_frame: FrameId },
}

/// Result of [`FragmentReassembler::try_reassemble`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ReassemblyOutcome {
    Complete(CompleteMessage),
    AwaitingMore,
    PartOf { completed_in: FrameId },
}

#[derive(Debug, Default)]
pub struct FragmentReassembler {
    messages: HashMap<FragmentKey, FragmentedMessage>,
}

impl FragmentReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store one fragment. A sequence number already held from another
    /// frame is a duplicate and leaves the message untouched.
    pub fn add_fragment(
        &mut self,
        key: &FragmentKey,
        tsn: u32,
        begin: bool,
        end: bool,
        payload: Bytes,
        frame: FrameId,
    ) -> FragmentAdd {
        let message = self.messages.entry(key.clone()).or_default();

        if let Some(existing) = message.fragments.get(&tsn) {
            if existing.frame == frame {
                return FragmentAdd::AlreadyPresent;
            }
            debug!(
                tsn,
                frame,
                original = existing.frame,
                stream = key.stream_id,
                "Duplicate fragment"
            );
            metrics::counter!("sctp_duplicate_fragments_total").increment(1);
            return FragmentAdd::Duplicate {
                original_frame: existing.frame,
            };
        }

        message.fragments.insert(
            tsn,
            Fragment {
                tsn,
                frame,
                length: payload.len(),
                begin,
                end,
                payload: Some(payload),
            },
        );
        if begin {
            let pos = message.begins.partition_point(|b| *b > tsn);
            message.begins.insert(pos, tsn);
        }
        if end {
            let pos = message.ends.partition_point(|e| *e < tsn);
            message.ends.insert(pos, tsn);
        }
        trace!(tsn, frame, begin, end, "Fragment stored");
        FragmentAdd::Added
    }

    /// Reassemble the message containing `tsn` if all its fragments are in.
    ///
    /// A message that is already complete is returned again only to the
    /// frame that completed it.
    pub fn try_reassemble(&mut self, key: &FragmentKey, tsn: u32, frame: FrameId) -> ReassemblyOutcome {
        let Some(message) = self.messages.get_mut(key) else {
            return ReassemblyOutcome::AwaitingMore;
        };

        if let Some(done) = message.completed.iter().find(|m| m.contains(tsn)) {
            return if done.completed_in == frame {
                ReassemblyOutcome::Complete(done.clone())
            } else {
                ReassemblyOutcome::PartOf {
                    completed_in: done.completed_in,
                }
            };
        }

        let Some((begin, end)) = message.bounding_run(tsn) else {
            return ReassemblyOutcome::AwaitingMore;
        };

        let complete = message.assemble(begin, end, frame);
        debug!(
            begin,
            end,
            frame,
            length = complete.data.len(),
            fragments = end.wrapping_sub(begin) + 1,
            "Message reassembled"
        );
        metrics::counter!("sctp_messages_reassembled_total").increment(1);
        ReassemblyOutcome::Complete(complete)
    }

    pub fn message(&self, key: &FragmentKey) -> Option<&FragmentedMessage> {
        self.messages.get(key)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> FragmentKey {
        FragmentKey {
            source_port: 2905,
            destination_port: 2905,
            vtag: 0xdead_beef,
            stream_id: 1,
            sequence: 9,
            unordered: false,
        }
    }

    fn add(r: &mut FragmentReassembler, tsn: u32, begin: bool, end: bool, data: &'static [u8], frame: FrameId) -> FragmentAdd {
        r.add_fragment(&key(), tsn, begin, end, Bytes::from_static(data), frame)
    }

    #[test]
    fn test_three_fragments_in_order() {
        let mut r = FragmentReassembler::new();
        assert_eq!(add(&mut r, 5, true, false, b"AB", 1), FragmentAdd::Added);
        assert_eq!(r.try_reassemble(&key(), 5, 1), ReassemblyOutcome::AwaitingMore);
        add(&mut r, 6, false, false, b"CD", 2);
        assert_eq!(r.try_reassemble(&key(), 6, 2), ReassemblyOutcome::AwaitingMore);
        add(&mut r, 7, false, true, b"EF", 3);

        match r.try_reassemble(&key(), 7, 3) {
            ReassemblyOutcome::Complete(message) => {
                assert_eq!(&message.data[..], b"ABCDEF");
                assert_eq!(message.frames, vec![1, 2, 3]);
                assert_eq!((message.begin, message.end), (5, 7));
                assert_eq!(message.completed_in, 3);
            }
            other => panic!("unexpected {other:?}"),
        }

        let stored = r.message(&key()).unwrap();
        assert!(stored.fragment(6).unwrap().is_consumed());
        assert_eq!(stored.fragment(6).unwrap().length, 2);
    }

    #[test]
    fn test_out_of_order_arrival() {
        let mut r = FragmentReassembler::new();
        add(&mut r, 7, false, true, b"EF", 3);
        assert_eq!(r.try_reassemble(&key(), 7, 3), ReassemblyOutcome::AwaitingMore);
        add(&mut r, 5, true, false, b"AB", 4);
        assert_eq!(r.try_reassemble(&key(), 5, 4), ReassemblyOutcome::AwaitingMore);
        add(&mut r, 6, false, false, b"CD", 5);

        let ReassemblyOutcome::Complete(message) = r.try_reassemble(&key(), 6, 5) else {
            panic!("expected completion");
        };
        assert_eq!(&message.data[..], b"ABCDEF");
        assert_eq!(message.frames, vec![4, 5, 3]);
    }

    #[test]
    fn test_wraparound_span() {
        let mut r = FragmentReassembler::new();
        add(&mut r, u32::MAX, true, false, b"head", 10);
        add(&mut r, 0, false, true, b"tail", 11);

        let ReassemblyOutcome::Complete(message) = r.try_reassemble(&key(), 0, 11) else {
            panic!("expected completion");
        };
        assert_eq!(&message.data[..], b"headtail");
        assert_eq!((message.begin, message.end), (u32::MAX, 0));
        assert!(message.contains(u32::MAX));
        assert!(message.contains(0));
        assert!(!message.contains(1));
    }

    #[test]
    fn test_duplicate_does_not_alter_message() {
        let mut r = FragmentReassembler::new();
        add(&mut r, 5, true, false, b"AB", 1);
        assert_eq!(
            add(&mut r, 5, true, false, b"XX", 2),
            FragmentAdd::Duplicate { original_frame: 1 }
        );
        assert_eq!(add(&mut r, 5, true, false, b"AB", 1), FragmentAdd::AlreadyPresent);
        add(&mut r, 6, false, true, b"CD", 3);

        let ReassemblyOutcome::Complete(message) = r.try_reassemble(&key(), 6, 3) else {
            panic!("expected completion");
        };
        assert_eq!(&message.data[..], b"ABCD");

        // Late duplicate after completion
        assert_eq!(
            add(&mut r, 6, false, true, b"ZZ", 8),
            FragmentAdd::Duplicate { original_frame: 3 }
        );
        assert_eq!(r.message(&key()).unwrap().completed()[0].data, Bytes::from_static(b"ABCD"));
    }

    #[test]
    fn test_replay_of_completed_message() {
        let mut r = FragmentReassembler::new();
        add(&mut r, 5, true, false, b"AB", 1);
        add(&mut r, 6, false, true, b"CD", 2);
        let first = r.try_reassemble(&key(), 6, 2);

        assert_eq!(r.try_reassemble(&key(), 6, 2), first);
        assert_eq!(
            r.try_reassemble(&key(), 5, 1),
            ReassemblyOutcome::PartOf { completed_in: 2 }
        );
        assert_eq!(r.message(&key()).unwrap().completed().len(), 1);
    }

    #[test]
    fn test_two_messages_under_one_key() {
        let mut r = FragmentReassembler::new();
        add(&mut r, 1, true, false, b"a", 1);
        add(&mut r, 2, false, true, b"b", 1);
        add(&mut r, 3, true, false, b"c", 2);
        add(&mut r, 4, false, true, b"d", 2);

        let ReassemblyOutcome::Complete(second) = r.try_reassemble(&key(), 4, 2) else {
            panic!("expected second message");
        };
        assert_eq!(&second.data[..], b"cd");
        assert_eq!(second.frames, vec![2]);

        let ReassemblyOutcome::Complete(first) = r.try_reassemble(&key(), 2, 1) else {
            panic!("expected first message");
        };
        assert_eq!(&first.data[..], b"ab");
    }

    #[test]
    fn test_stray_boundary_blocks_run() {
        let mut r = FragmentReassembler::new();
        add(&mut r, 1, true, false, b"a", 1);
        add(&mut r, 2, true, false, b"b", 2);
        add(&mut r, 3, false, true, b"c", 3);

        // TSN 1 has no end of its own before the next begin
        assert_eq!(r.try_reassemble(&key(), 1, 1), ReassemblyOutcome::AwaitingMore);
        let ReassemblyOutcome::Complete(message) = r.try_reassemble(&key(), 3, 3) else {
            panic!("expected completion");
        };
        assert_eq!(&message.data[..], b"bc");
    }
}

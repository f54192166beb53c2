//! Association matching
//!
//! A packet carries at most two verification tags: the header tag, which
//! belongs to the receiving endpoint, and for INIT / INIT-ACK the initiate
//! tag, which belongs to the sender. Most packets show only one of them, so
//! associations are looked up in two tables:
//!
//! - the *half* table, keyed by the port pair and a single known tag, used
//!   while one of the two tags is still unknown and for every single-tag
//!   packet afterwards;
//! - the *full* table, keyed by ports and both tags, filled once both tags
//!   are known (one entry per orientation).
//!
//! A zero tag is a wildcard. A nonzero tag, once learned, never changes.

use crate::types::{AssociationRef, Direction, FrameId};
use serde::Serialize;
use std::collections::HashMap;
use std::net::IpAddr;
use tracing::{debug, trace};

/// Identity information visible on one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagObservation {
    pub source_port: u16,
    pub destination_port: u16,
    pub source: IpAddr,
    pub destination: IpAddr,
    /// Tag chosen by the destination endpoint, 0 if not visible
    pub destination_tag: u32,
    /// Tag chosen by the source endpoint, 0 if not visible
    pub source_tag: u32,
}

impl TagObservation {
    fn known_tags(&self) -> usize {
        (self.destination_tag != 0) as usize + (self.source_tag != 0) as usize
    }
}

/// One association, oriented as the first packet that created it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Association {
    pub index: u32,
    pub sport: u16,
    pub dport: u16,
    pub saddr: IpAddr,
    pub daddr: IpAddr,
    /// Tag chosen by the `dport` endpoint
    pub vtag1: u32,
    /// Tag chosen by the `sport` endpoint
    pub vtag2: u32,
    pub first_frame: FrameId,
}

impl Association {
    pub fn is_complete(&self) -> bool {
        self.vtag1 != 0 && self.vtag2 != 0
    }

    /// Match relation; checks the forward orientation first
    fn matches(&self, obs: &TagObservation) -> Option<Direction> {
        if obs.source_port == self.sport
            && obs.destination_port == self.dport
            && tags_match(
                (obs.destination_tag, obs.source_tag),
                (self.vtag1, self.vtag2),
                obs.source == self.saddr && obs.destination == self.daddr,
            )
        {
            return Some(Direction::Forward);
        }

        if obs.source_port == self.dport
            && obs.destination_port == self.sport
            && tags_match(
                (obs.destination_tag, obs.source_tag),
                (self.vtag2, self.vtag1),
                obs.source == self.daddr && obs.destination == self.saddr,
            )
        {
            return Some(Direction::Reverse);
        }

        None
    }
}

fn vtag_match(a: u32, b: u32) -> bool {
    a == b || a == 0 || b == 0
}

/// `packet` and `stored` are (destination tag, source tag) in the same orientation
fn tags_match(packet: (u32, u32), stored: (u32, u32), addresses_equal: bool) -> bool {
    if !vtag_match(packet.0, stored.0) || !vtag_match(packet.1, stored.1) {
        return false;
    }

    let concrete = (packet.0 != 0 && packet.0 == stored.0) || (packet.1 != 0 && packet.1 == stored.1);
    let other_unknown_on_both =
        (packet.0 == 0 && stored.0 == 0) || (packet.1 == 0 && stored.1 == 0);

    // Without a confirmed second tag only the addresses tell unrelated flows apart
    if !concrete || other_unknown_on_both {
        return addresses_equal;
    }
    true
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct HalfKey {
    low_port: u16,
    high_port: u16,
    tag: u32,
}

impl HalfKey {
    fn new(a: u16, b: u16, tag: u32) -> Self {
        Self {
            low_port: a.min(b),
            high_port: a.max(b),
            tag,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FullKey {
    sport: u16,
    dport: u16,
    destination_tag: u32,
    source_tag: u32,
}

/// Resolves packets to association indices
#[derive(Debug, Default)]
pub struct AssociationMatcher {
    associations: Vec<Association>,
    half: HashMap<HalfKey, Vec<u32>>,
    full: HashMap<FullKey, AssociationRef>,
    /// Result recorded for each analyzed frame
    frames: HashMap<FrameId, AssociationRef>,
}

impl AssociationMatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a packet to its association.
    ///
    /// On replay (`visited`) nothing is mutated; the result recorded for the
    /// frame during analysis is returned, `None` meaning unresolved.
    pub fn resolve(
        &mut self,
        frame: FrameId,
        visited: bool,
        obs: &TagObservation,
    ) -> Option<AssociationRef> {
        if visited {
            let recorded = self.frames.get(&frame).copied();
            if recorded.is_none() {
                debug!(frame, "No association recorded for replayed frame");
            }
            return recorded;
        }
        if let Some(recorded) = self.frames.get(&frame) {
            return Some(*recorded);
        }

        let resolved = match self.lookup(obs) {
            Some(found) => {
                self.learn_tags(found, obs);
                found
            }
            None => self.create(frame, obs),
        };

        trace!(
            frame,
            index = resolved.index,
            direction = ?resolved.direction,
            "Association resolved"
        );
        self.frames.insert(frame, resolved);
        Some(resolved)
    }

    /// Association by index
    pub fn association(&self, index: u32) -> Option<&Association> {
        self.associations.get(index as usize)
    }

    pub fn associations(&self) -> &[Association] {
        &self.associations
    }

    pub fn len(&self) -> usize {
        self.associations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.associations.is_empty()
    }

    fn lookup(&self, obs: &TagObservation) -> Option<AssociationRef> {
        if obs.known_tags() == 2 {
            let key = FullKey {
                sport: obs.source_port,
                dport: obs.destination_port,
                destination_tag: obs.destination_tag,
                source_tag: obs.source_tag,
            };
            if let Some(found) = self.full.get(&key) {
                return Some(*found);
            }
        }

        let mut probe = [obs.destination_tag, obs.source_tag];
        if obs.known_tags() == 0 {
            probe = [0, 0];
        }

        for (i, tag) in probe.iter().enumerate() {
            if (*tag == 0 && obs.known_tags() > 0) || (i == 1 && probe[0] == probe[1]) {
                continue;
            }
            let key = HalfKey::new(obs.source_port, obs.destination_port, *tag);
            let Some(bucket) = self.half.get(&key) else {
                continue;
            };
            for index in bucket {
                let assoc = &self.associations[*index as usize];
                if let Some(direction) = assoc.matches(obs) {
                    return Some(AssociationRef {
                        index: *index,
                        direction,
                    });
                }
            }
        }

        None
    }

    fn create(&mut self, frame: FrameId, obs: &TagObservation) -> AssociationRef {
        let index = self.associations.len() as u32;
        let assoc = Association {
            index,
            sport: obs.source_port,
            dport: obs.destination_port,
            saddr: obs.source,
            daddr: obs.destination,
            vtag1: obs.destination_tag,
            vtag2: obs.source_tag,
            first_frame: frame,
        };
        debug!(
            index,
            sport = assoc.sport,
            dport = assoc.dport,
            vtag1 = assoc.vtag1,
            vtag2 = assoc.vtag2,
            "New association"
        );

        if obs.known_tags() == 0 {
            self.register_half(&assoc, 0);
        }
        for tag in [assoc.vtag1, assoc.vtag2] {
            if tag != 0 {
                self.register_half(&assoc, tag);
            }
        }
        if assoc.is_complete() {
            self.register_full(&assoc);
        }
        self.associations.push(assoc);

        AssociationRef {
            index,
            direction: Direction::Forward,
        }
    }

    /// Fill tags that were still unknown; known tags are never overwritten
    fn learn_tags(&mut self, found: AssociationRef, obs: &TagObservation) {
        let (tag1, tag2) = match found.direction {
            Direction::Forward => (obs.destination_tag, obs.source_tag),
            Direction::Reverse => (obs.source_tag, obs.destination_tag),
        };

        let mut assoc = self.associations[found.index as usize].clone();
        let was_complete = assoc.is_complete();
        let mut learned = Vec::new();

        if assoc.vtag1 == 0 && tag1 != 0 {
            assoc.vtag1 = tag1;
            learned.push(tag1);
        }
        if assoc.vtag2 == 0 && tag2 != 0 {
            assoc.vtag2 = tag2;
            learned.push(tag2);
        }
        if learned.is_empty() {
            return;
        }

        for tag in learned {
            self.register_half(&assoc, tag);
        }
        if !was_complete && assoc.is_complete() {
            debug!(
                index = assoc.index,
                vtag1 = assoc.vtag1,
                vtag2 = assoc.vtag2,
                "Association tags confirmed"
            );
            self.register_full(&assoc);
        }
        self.associations[found.index as usize] = assoc;
    }

    fn register_half(&mut self, assoc: &Association, tag: u32) {
        let bucket = self
            .half
            .entry(HalfKey::new(assoc.sport, assoc.dport, tag))
            .or_default();
        if !bucket.contains(&assoc.index) {
            bucket.push(assoc.index);
        }
    }

    fn register_full(&mut self, assoc: &Association) {
        self.full.insert(
            FullKey {
                sport: assoc.sport,
                dport: assoc.dport,
                destination_tag: assoc.vtag1,
                source_tag: assoc.vtag2,
            },
            AssociationRef {
                index: assoc.index,
                direction: Direction::Forward,
            },
        );
        self.full.insert(
            FullKey {
                sport: assoc.dport,
                dport: assoc.sport,
                destination_tag: assoc.vtag2,
                source_tag: assoc.vtag1,
            },
            AssociationRef {
                index: assoc.index,
                direction: Direction::Reverse,
            },
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    const A: u32 = 0xAAAA_0001;
    const B: u32 = 0xBBBB_0002;

    fn ip(last: u8) -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(10, 0, 0, last))
    }

    fn obs(sport: u16, dport: u16, dst_tag: u32, src_tag: u32) -> TagObservation {
        TagObservation {
            source_port: sport,
            destination_port: dport,
            source: if sport == 1000 { ip(1) } else { ip(2) },
            destination: if dport == 1000 { ip(1) } else { ip(2) },
            destination_tag: dst_tag,
            source_tag: src_tag,
        }
    }

    #[test]
    fn test_single_then_both_tags_same_index() {
        let mut matcher = AssociationMatcher::new();
        let p1 = matcher.resolve(1, false, &obs(1000, 2000, A, 0)).unwrap();
        let p2 = matcher.resolve(2, false, &obs(1000, 2000, A, B)).unwrap();
        assert_eq!(p1.index, p2.index);
        assert_eq!(matcher.len(), 1);
        assert!(matcher.association(p1.index).unwrap().is_complete());
    }

    #[test]
    fn test_both_then_single_tag_same_index() {
        let mut matcher = AssociationMatcher::new();
        let p2 = matcher.resolve(1, false, &obs(1000, 2000, A, B)).unwrap();
        let p1 = matcher.resolve(2, false, &obs(1000, 2000, A, 0)).unwrap();
        assert_eq!(p1.index, p2.index);
        assert_eq!(matcher.len(), 1);
    }

    #[test]
    fn test_handshake_directions() {
        let mut matcher = AssociationMatcher::new();
        // INIT: header tag 0, initiate tag A (owned by the client)
        let init = matcher.resolve(1, false, &obs(1000, 2000, 0, A)).unwrap();
        // INIT-ACK: header tag A, initiate tag B (owned by the server)
        let init_ack = matcher.resolve(2, false, &obs(2000, 1000, A, B)).unwrap();
        // DATA client -> server carries B
        let data = matcher.resolve(3, false, &obs(1000, 2000, B, 0)).unwrap();
        // SACK server -> client carries A
        let sack = matcher.resolve(4, false, &obs(2000, 1000, A, 0)).unwrap();

        assert_eq!(init.direction, Direction::Forward);
        assert_eq!(init_ack.direction, Direction::Reverse);
        assert_eq!(data.direction, Direction::Forward);
        assert_eq!(sack.direction, Direction::Reverse);
        assert!([init_ack, data, sack].iter().all(|r| r.index == init.index));

        let assoc = matcher.association(init.index).unwrap();
        assert_eq!((assoc.vtag1, assoc.vtag2), (B, A));
    }

    #[test]
    fn test_zero_tag_flows_need_matching_addresses() {
        let mut matcher = AssociationMatcher::new();
        let first = matcher.resolve(1, false, &obs(1000, 2000, 0, A)).unwrap();

        let mut other = obs(1000, 2000, 0, A);
        other.source = ip(77);
        let second = matcher.resolve(2, false, &other).unwrap();
        assert_ne!(first.index, second.index);
    }

    #[test]
    fn test_known_tag_never_overwritten() {
        let mut matcher = AssociationMatcher::new();
        let first = matcher.resolve(1, false, &obs(1000, 2000, A, B)).unwrap();
        // Same ports, conflicting source tag: a different association
        let restarted = matcher.resolve(2, false, &obs(1000, 2000, A, 0xDEAD)).unwrap();
        assert_ne!(first.index, restarted.index);

        let assoc = matcher.association(first.index).unwrap();
        assert_eq!((assoc.vtag1, assoc.vtag2), (A, B));
    }

    #[test]
    fn test_replay_does_not_mutate() {
        let mut matcher = AssociationMatcher::new();
        let first = matcher.resolve(1, false, &obs(1000, 2000, A, 0)).unwrap();

        assert_eq!(matcher.resolve(1, true, &obs(1000, 2000, A, 0)), Some(first));
        // Never analyzed: unresolved, and nothing created
        assert_eq!(matcher.resolve(9, true, &obs(3000, 4000, B, 0)), None);
        assert_eq!(matcher.len(), 1);
    }
}

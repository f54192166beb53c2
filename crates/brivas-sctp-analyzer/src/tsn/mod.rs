//! Per-direction TSN tracking
//!
//! Each direction of an association gets a [`HalfAssociation`] holding one
//! [`TsnRecord`] per TSN it sent. TSNs are stored relative to the first TSN
//! seen in that direction so that ordering survives 32-bit wraparound.
//! Half-associations live in an arena owned by [`TsnTracker`]; the peer
//! direction is referenced by index.

mod sack;

pub use sack::{AckKind, AckedTsn, GapBlockIssue, SackAnalysis, SackProcessor};

use crate::types::{AssociationRef, Direction, FrameId, FrameStamp, Timestamp};
use serde::Serialize;
use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{debug, trace, warn};

/// Index of a half-association in the tracker arena
pub type HalfId = usize;

/// Elapsed time between two capture timestamps, `None` if negative
pub(crate) fn elapsed(from: Timestamp, to: Timestamp) -> Option<Duration> {
    (to - from).to_std().ok()
}

/// Lifecycle of one TSN
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TsnRecord {
    pub tsn: u32,
    pub first_transmit: FrameStamp,
    /// Retransmissions, capped at the configured limit
    pub retransmissions: Vec<FrameStamp>,
    /// All retransmissions, including those past the cap
    pub retransmission_count: u32,
    /// First acknowledgment; later acks never replace it
    pub ack: Option<FrameStamp>,
    last_frame: FrameId,
}

impl TsnRecord {
    fn new(tsn: u32, stamp: FrameStamp) -> Self {
        Self {
            tsn,
            first_transmit: stamp,
            retransmissions: Vec::new(),
            retransmission_count: 0,
            ack: None,
            last_frame: stamp.frame,
        }
    }

    /// Round trip from first transmission to acknowledgment
    pub fn rtt(&self) -> Option<Duration> {
        self.ack
            .and_then(|ack| elapsed(self.first_transmit.timestamp, ack.timestamp))
    }
}

/// Retransmission facts for a DATA chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Retransmission {
    /// Frame carrying the first transmission
    pub original: FrameStamp,
    /// Time since the first transmission
    pub delay: Option<Duration>,
    /// Number of retransmissions so far, this one included
    pub count: u32,
    /// Frame that had already acknowledged this TSN (reneging indicator)
    pub after_ack_in: Option<FrameId>,
    /// The retransmission history cap was exceeded
    pub history_truncated: bool,
}

/// Result of recording one DATA transmission
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransmissionOutcome {
    pub tsn: u32,
    pub relative_tsn: u32,
    pub retransmission: Option<Retransmission>,
    /// Acknowledgment already known when the chunk was analyzed
    pub acked: Option<FrameStamp>,
    pub rtt: Option<Duration>,
}

impl TransmissionOutcome {
    pub fn is_retransmission(&self) -> bool {
        self.retransmission.is_some()
    }
}

/// Send-side state of one endpoint of an association
#[derive(Debug, Clone)]
pub struct HalfAssociation {
    pub association: AssociationRef,
    /// Baseline for relative TSNs
    first_tsn: Option<u32>,
    records: BTreeMap<u32, TsnRecord>,
    /// Highest relative cumulative ack seen, including skipped ones
    cumulative_ack: Option<u32>,
    /// Half-association of the other direction
    pub peer: Option<HalfId>,
}

impl HalfAssociation {
    pub fn new(association: AssociationRef) -> Self {
        Self {
            association,
            first_tsn: None,
            records: BTreeMap::new(),
            cumulative_ack: None,
            peer: None,
        }
    }

    pub fn first_tsn(&self) -> Option<u32> {
        self.first_tsn
    }

    /// Set the baseline unless one is already established
    pub fn set_baseline(&mut self, tsn: u32) -> bool {
        if self.first_tsn.is_some() {
            return false;
        }
        trace!(tsn, "TSN baseline set");
        self.first_tsn = Some(tsn);
        true
    }

    /// TSN relative to the baseline, modulo 2^32
    pub fn relative(&self, tsn: u32) -> Option<u32> {
        self.first_tsn.map(|first| tsn.wrapping_sub(first))
    }

    pub fn record(&self, tsn: u32) -> Option<&TsnRecord> {
        self.relative(tsn).and_then(|rel| self.records.get(&rel))
    }

    pub fn records(&self) -> impl Iterator<Item = &TsnRecord> {
        self.records.values()
    }

    pub fn cumulative_ack(&self) -> Option<u32> {
        self.cumulative_ack
    }

    /// Record a DATA chunk carrying `tsn`.
    ///
    /// The first frame carrying a TSN is its first transmission; any later
    /// frame is a retransmission.
    pub fn record_transmission(
        &mut self,
        tsn: u32,
        stamp: FrameStamp,
        max_tracked: usize,
    ) -> TransmissionOutcome {
        self.set_baseline(tsn);
        let relative = self.relative(tsn).unwrap_or(0);

        let record = match self.records.entry(relative) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                entry.insert(TsnRecord::new(tsn, stamp));
                return TransmissionOutcome {
                    tsn,
                    relative_tsn: relative,
                    retransmission: None,
                    acked: None,
                    rtt: None,
                };
            }
        };

        if record.first_transmit.frame == stamp.frame {
            return TransmissionOutcome {
                tsn,
                relative_tsn: relative,
                retransmission: None,
                acked: record.ack,
                rtt: record.rtt(),
            };
        }

        let count = match record.retransmissions.iter().position(|r| r.frame == stamp.frame) {
            Some(pos) => pos as u32 + 1,
            None => {
                if stamp.frame > record.last_frame {
                    record.retransmission_count += 1;
                    record.last_frame = stamp.frame;
                    if record.retransmissions.len() < max_tracked {
                        record.retransmissions.push(stamp);
                    }
                    metrics::counter!("sctp_tsn_retransmissions_total").increment(1);
                }
                record.retransmission_count
            }
        };

        let after_ack_in = record
            .ack
            .filter(|ack| ack.frame < stamp.frame)
            .map(|ack| ack.frame);
        if after_ack_in.is_some() {
            warn!(tsn, frame = stamp.frame, "TSN retransmitted after being acknowledged");
            metrics::counter!("sctp_tsn_reneged_total").increment(1);
        }

        let history_truncated = record.retransmission_count as usize > max_tracked;
        debug!(
            tsn,
            frame = stamp.frame,
            original = record.first_transmit.frame,
            count,
            "Retransmission"
        );

        TransmissionOutcome {
            tsn,
            relative_tsn: relative,
            retransmission: Some(Retransmission {
                original: record.first_transmit,
                delay: elapsed(record.first_transmit.timestamp, stamp.timestamp),
                count,
                after_ack_in,
                history_truncated,
            }),
            acked: record.ack,
            rtt: record.rtt(),
        }
    }

    /// Acknowledge unacked TSNs in the relative range `[low, high]` that
    /// were first sent before the acknowledging frame.
    fn acknowledge_range(
        &mut self,
        low: u32,
        high: u32,
        stamp: FrameStamp,
        kind: AckKind,
        out: &mut Vec<AckedTsn>,
    ) {
        for (relative, record) in self.records.range_mut(low..=high) {
            if record.ack.is_some() || record.first_transmit.frame >= stamp.frame {
                continue;
            }
            record.ack = Some(stamp);
            out.push(AckedTsn {
                tsn: record.tsn,
                relative_tsn: *relative,
                sent_in: record.first_transmit.frame,
                rtt: record.rtt(),
                kind,
            });
        }
    }
}

/// Arena of half-associations
#[derive(Debug, Default)]
pub struct TsnTracker {
    halves: Vec<HalfAssociation>,
    by_association: HashMap<(u32, Direction), HalfId>,
}

impl TsnTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Half-association sending in `association.direction`, created on
    /// first use and linked to its peer when both exist.
    pub fn half_for(&mut self, association: AssociationRef) -> HalfId {
        let key = (association.index, association.direction);
        if let Some(id) = self.by_association.get(&key) {
            return *id;
        }

        let id = self.halves.len();
        self.halves.push(HalfAssociation::new(association));
        self.by_association.insert(key, id);

        let peer_key = (association.index, association.direction.reverse());
        if let Some(peer) = self.by_association.get(&peer_key).copied() {
            self.halves[id].peer = Some(peer);
            self.halves[peer].peer = Some(id);
            trace!(index = association.index, "Half-associations linked");
        }
        id
    }

    pub fn find(&self, association: AssociationRef) -> Option<HalfId> {
        self.by_association
            .get(&(association.index, association.direction))
            .copied()
    }

    pub fn half(&self, id: HalfId) -> Option<&HalfAssociation> {
        self.halves.get(id)
    }

    pub fn half_mut(&mut self, id: HalfId) -> Option<&mut HalfAssociation> {
        self.halves.get_mut(id)
    }

    /// Peer of `id`, if the other direction has been seen
    pub fn peer_mut(&mut self, id: HalfId) -> Option<&mut HalfAssociation> {
        let peer = self.halves.get(id)?.peer?;
        self.halves.get_mut(peer)
    }

    pub fn len(&self) -> usize {
        self.halves.len()
    }

    pub fn is_empty(&self) -> bool {
        self.halves.is_empty()
    }
}

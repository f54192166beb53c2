//! SACK / NR-SACK processing
//!
//! A SACK sent in one direction acknowledges TSNs sent by the peer, so every
//! operation here takes the *peer's* half-association.

use super::HalfAssociation;
use crate::config::TsnAnalysisConfig;
use crate::sctp::{GapBlock, SackChunk};
use crate::types::{FrameId, FrameStamp};
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// How a TSN got acknowledged
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AckKind {
    Cumulative,
    Gap,
    NonRenegableGap,
}

/// A TSN newly acknowledged by a SACK
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AckedTsn {
    pub tsn: u32,
    pub relative_tsn: u32,
    /// Frame of the first transmission
    pub sent_in: FrameId,
    pub rtt: Option<Duration>,
    pub kind: AckKind,
}

/// Gap block problems; never stop processing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum GapBlockIssue {
    /// Start offset beyond end offset; the block is skipped
    Malformed {
        index: usize,
        non_renegable: bool,
        start: u16,
        end: u16,
    },
    /// Block does not start past the previous block's end
    OutOfOrder {
        index: usize,
        non_renegable: bool,
        start: u16,
        end: u16,
    },
}

/// Facts produced by one SACK or NR-SACK chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SackAnalysis {
    pub cumulative_tsn_ack: u32,
    pub non_renegable: bool,
    /// TSNs acknowledged for the first time by this chunk
    pub acked: Vec<AckedTsn>,
    pub gap_block_issues: Vec<GapBlockIssue>,
    /// TSNs covered by the (valid) gap blocks
    pub gap_acked_tsns: u32,
    pub gap_ack_threshold_exceeded: bool,
    pub duplicate_tsns: Vec<u32>,
}

/// Applies SACK information to a half-association
#[derive(Debug, Clone)]
pub struct SackProcessor {
    ack_span_limit: u32,
    gap_ack_warning_threshold: u32,
}

impl SackProcessor {
    pub fn new(config: &TsnAnalysisConfig) -> Self {
        Self {
            ack_span_limit: config.ack_span_limit,
            gap_ack_warning_threshold: config.gap_ack_warning_threshold,
        }
    }

    /// Process one SACK chunk: cumulative ack first, then every gap block in
    /// wire order. `peer` is `None` when the acknowledged direction has not
    /// been seen yet; only the field checks are performed then.
    pub fn process(
        &self,
        mut peer: Option<&mut HalfAssociation>,
        sack: &SackChunk,
        non_renegable: bool,
        stamp: FrameStamp,
    ) -> SackAnalysis {
        let mut analysis = SackAnalysis {
            cumulative_tsn_ack: sack.cumulative_tsn_ack,
            non_renegable,
            acked: Vec::new(),
            gap_block_issues: Vec::new(),
            gap_acked_tsns: 0,
            gap_ack_threshold_exceeded: false,
            duplicate_tsns: sack.duplicate_tsns.clone(),
        };

        if let Some(peer) = peer.as_deref_mut() {
            analysis
                .acked
                .extend(self.apply_cumulative_ack(peer, sack.cumulative_tsn_ack, stamp));
        }

        let block_sets = [
            (&sack.gap_blocks, false, AckKind::Gap),
            (&sack.nr_gap_blocks, true, AckKind::NonRenegableGap),
        ];
        for (blocks, nr, kind) in block_sets {
            let mut previous_end: Option<u16> = None;

            for (index, block) in blocks.iter().enumerate() {
                if block.start > block.end {
                    analysis.gap_block_issues.push(GapBlockIssue::Malformed {
                        index,
                        non_renegable: nr,
                        start: block.start,
                        end: block.end,
                    });
                    continue;
                }
                if previous_end.is_some_and(|prev| block.start <= prev) {
                    analysis.gap_block_issues.push(GapBlockIssue::OutOfOrder {
                        index,
                        non_renegable: nr,
                        start: block.start,
                        end: block.end,
                    });
                }
                previous_end = Some(block.end);

                if !nr {
                    analysis.gap_acked_tsns += u32::from(block.end - block.start) + 1;
                }
                if let Some(peer) = peer.as_deref_mut() {
                    analysis.acked.extend(self.apply_gap_block(
                        peer,
                        *block,
                        sack.cumulative_tsn_ack,
                        stamp,
                        kind,
                    ));
                }
            }
        }

        if analysis.gap_acked_tsns > self.gap_ack_warning_threshold {
            analysis.gap_ack_threshold_exceeded = true;
            debug!(
                gap_acked = analysis.gap_acked_tsns,
                frame = stamp.frame,
                "Gap-acked TSN count above threshold"
            );
        }
        if !analysis.gap_block_issues.is_empty() {
            warn!(
                frame = stamp.frame,
                issues = analysis.gap_block_issues.len(),
                "Invalid gap ack blocks"
            );
        }
        if !analysis.acked.is_empty() {
            metrics::counter!("sctp_tsn_acked_total").increment(analysis.acked.len() as u64);
        }

        analysis
    }

    /// Acknowledge every unacked TSN of `peer` up to `cum_tsn` that was first
    /// sent before `stamp.frame`.
    ///
    /// The walk covers at most `ack_span_limit` TSNs ending at `cum_tsn`. A
    /// SACK advancing more than that past the previous cumulative point is
    /// skipped, but later SACKs are measured from its cumulative point.
    pub fn apply_cumulative_ack(
        &self,
        peer: &mut HalfAssociation,
        cum_tsn: u32,
        stamp: FrameStamp,
    ) -> Vec<AckedTsn> {
        let mut acked = Vec::new();
        let Some(rel_cum) = peer.relative(cum_tsn) else {
            return acked;
        };
        // Serial number arithmetic: the upper half of the space lies behind the baseline
        if rel_cum > i32::MAX as u32 {
            trace!(cum_tsn, "Cumulative ack precedes TSN baseline");
            return acked;
        }

        let advance = match peer.cumulative_ack {
            Some(prev) if rel_cum <= prev => None,
            Some(prev) => Some(rel_cum - prev),
            None => Some(rel_cum + 1),
        };
        peer.cumulative_ack = Some(peer.cumulative_ack.map_or(rel_cum, |prev| prev.max(rel_cum)));
        if let Some(span) = advance.filter(|span| *span > self.ack_span_limit) {
            debug!(
                cum_tsn,
                span,
                limit = self.ack_span_limit,
                "Cumulative ack span too large, skipped"
            );
            return acked;
        }

        let low = rel_cum.saturating_sub(self.ack_span_limit.saturating_sub(1));
        peer.acknowledge_range(low, rel_cum, stamp, AckKind::Cumulative, &mut acked);
        acked
    }

    /// Acknowledge TSNs in `[cum_tsn + start, cum_tsn + end]`
    pub fn apply_gap_block(
        &self,
        peer: &mut HalfAssociation,
        block: GapBlock,
        cum_tsn: u32,
        stamp: FrameStamp,
        kind: AckKind,
    ) -> Vec<AckedTsn> {
        let mut acked = Vec::new();
        if block.start > block.end {
            return acked;
        }
        let Some(rel_cum) = peer.relative(cum_tsn) else {
            return acked;
        };
        let (Some(low), Some(high)) = (
            rel_cum.checked_add(u32::from(block.start)),
            rel_cum.checked_add(u32::from(block.end)),
        ) else {
            return acked;
        };
        if high - low >= self.ack_span_limit {
            return acked;
        }

        peer.acknowledge_range(low, high, stamp, kind, &mut acked);
        acked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AssociationRef, Direction};
    use chrono::{TimeZone, Utc};

    fn stamp(frame: FrameId, millis: i64) -> FrameStamp {
        FrameStamp::new(frame, Utc.timestamp_millis_opt(millis).unwrap())
    }

    fn processor() -> SackProcessor {
        SackProcessor::new(&TsnAnalysisConfig::default())
    }

    fn half_with(tsns: &[(u32, FrameId)]) -> HalfAssociation {
        let mut half = HalfAssociation::new(AssociationRef {
            index: 0,
            direction: Direction::Forward,
        });
        for (tsn, frame) in tsns {
            half.record_transmission(*tsn, stamp(*frame, *frame as i64 * 10), 100);
        }
        half
    }

    fn sack(cum: u32, gaps: &[(u16, u16)]) -> SackChunk {
        SackChunk {
            cumulative_tsn_ack: cum,
            a_rwnd: 65535,
            gap_blocks: gaps.iter().map(|(s, e)| GapBlock { start: *s, end: *e }).collect(),
            nr_gap_blocks: vec![],
            duplicate_tsns: vec![],
        }
    }

    #[test]
    fn test_cumulative_ack_only_acks_earlier_transmissions() {
        let mut half = half_with(&[(10, 1), (11, 2), (12, 5)]);
        let p = processor();

        let acked = p.apply_cumulative_ack(&mut half, 12, stamp(4, 100));
        let tsns: Vec<u32> = acked.iter().map(|a| a.tsn).collect();
        assert_eq!(tsns, vec![10, 11]);
        assert_eq!(acked[0].rtt, Some(Duration::from_millis(90)));
        assert_eq!(acked[1].sent_in, 2);
        assert!(half.record(12).unwrap().ack.is_none());

        // A later SACK with the same cumulative point picks up TSN 12
        let acked = p.apply_cumulative_ack(&mut half, 12, stamp(6, 120));
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].tsn, 12);
        assert_eq!(half.cumulative_ack(), Some(2));

        // First writer wins
        let acked = p.apply_cumulative_ack(&mut half, 12, stamp(7, 130));
        assert!(acked.is_empty());
        assert_eq!(half.record(10).unwrap().ack.unwrap().frame, 4);
    }

    #[test]
    fn test_cumulative_ack_span_limit() {
        let mut half = half_with(&[(0, 1)]);
        let p = processor();
        // Relative span 0..=5000 is beyond the limit
        assert!(p.apply_cumulative_ack(&mut half, 5000, stamp(2, 0)).is_empty());
        assert!(half.record(0).unwrap().ack.is_none());
        assert_eq!(half.cumulative_ack(), Some(5000));

        assert_eq!(p.apply_cumulative_ack(&mut half, 4999, stamp(3, 0)).len(), 1);
    }

    #[test]
    fn test_skipped_span_does_not_stop_later_acks() {
        let mut half = HalfAssociation::new(AssociationRef {
            index: 0,
            direction: Direction::Forward,
        });
        for tsn in 0..6000 {
            half.record_transmission(tsn, stamp(1, 10), 100);
        }
        let p = processor();

        assert!(p.apply_cumulative_ack(&mut half, 5999, stamp(2, 20)).is_empty());
        assert_eq!(half.cumulative_ack(), Some(5999));

        half.record_transmission(6000, stamp(3, 30), 100);
        let acked = p.apply_cumulative_ack(&mut half, 6000, stamp(4, 40));
        assert!(acked.iter().any(|a| a.tsn == 6000));
        assert_eq!(half.record(6000).unwrap().ack.unwrap().frame, 4);

        half.record_transmission(6001, stamp(5, 50), 100);
        let acked = p.apply_cumulative_ack(&mut half, 6001, stamp(6, 60));
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].tsn, 6001);
        assert_eq!(half.cumulative_ack(), Some(6001));
    }

    #[test]
    fn test_late_first_transmission_below_marker_is_acked() {
        let mut half = half_with(&[(0, 1), (2, 2)]);
        let p = processor();

        let acked = p.apply_cumulative_ack(&mut half, 2, stamp(3, 30));
        assert_eq!(acked.iter().map(|a| a.tsn).collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(half.cumulative_ack(), Some(2));

        // TSN 1 only shows up in the capture after the marker passed it
        half.record_transmission(1, stamp(4, 40), 100);
        let acked = p.apply_cumulative_ack(&mut half, 3, stamp(5, 50));
        assert_eq!(acked.len(), 1);
        assert_eq!(acked[0].tsn, 1);
        assert_eq!(half.record(1).unwrap().ack.unwrap().frame, 5);
        assert_eq!(half.cumulative_ack(), Some(3));
    }

    #[test]
    fn test_cumulative_ack_before_baseline_is_ignored() {
        let mut half = half_with(&[(100, 1)]);
        assert!(processor()
            .apply_cumulative_ack(&mut half, 99, stamp(2, 0))
            .is_empty());
    }

    #[test]
    fn test_gap_blocks_ack_range() {
        let mut half = half_with(&[(1, 1), (2, 1), (3, 1), (4, 1), (5, 1), (6, 1)]);
        let analysis = processor().process(Some(&mut half), &sack(1, &[(2, 3), (5, 5)]), false, stamp(2, 50));

        let gap: Vec<u32> = analysis
            .acked
            .iter()
            .filter(|a| a.kind == AckKind::Gap)
            .map(|a| a.tsn)
            .collect();
        assert_eq!(gap, vec![3, 4, 6]);
        assert_eq!(analysis.gap_acked_tsns, 3);
        assert!(analysis.gap_block_issues.is_empty());
        assert!(half.record(2).unwrap().ack.is_none());
        assert!(half.record(5).unwrap().ack.is_none());
    }

    #[test]
    fn test_invalid_gap_blocks_do_not_stop_processing() {
        let mut half = half_with(&[(1, 1), (2, 1), (3, 1), (4, 1), (5, 1), (6, 1), (7, 1)]);
        let analysis = processor().process(
            Some(&mut half),
            &sack(1, &[(4, 2), (5, 6), (3, 3)]),
            false,
            stamp(2, 0),
        );

        assert_eq!(
            analysis.gap_block_issues,
            vec![
                GapBlockIssue::Malformed {
                    index: 0,
                    non_renegable: false,
                    start: 4,
                    end: 2
                },
                GapBlockIssue::OutOfOrder {
                    index: 2,
                    non_renegable: false,
                    start: 3,
                    end: 3
                },
            ]
        );
        let mut acked: Vec<u32> = analysis.acked.iter().map(|a| a.tsn).collect();
        acked.sort_unstable();
        assert_eq!(acked, vec![1, 4, 6, 7]);
    }

    #[test]
    fn test_without_peer_only_field_checks() {
        let analysis = processor().process(None, &sack(1, &[(3, 2)]), false, stamp(2, 0));
        assert!(analysis.acked.is_empty());
        assert_eq!(analysis.gap_block_issues.len(), 1);
    }

    #[test]
    fn test_gap_ack_threshold() {
        let mut half = half_with(&[(1, 1)]);
        let analysis = processor().process(Some(&mut half), &sack(1, &[(2, 102)]), false, stamp(2, 0));
        assert_eq!(analysis.gap_acked_tsns, 101);
        assert!(analysis.gap_ack_threshold_exceeded);
    }
}

//! Packet orchestration
//!
//! [`SctpAnalyzer`] owns every session table and runs each datagram through
//! checksum verification, association matching, TSN tracking, SACK
//! processing and reassembly. The first pass over a frame mutates state and
//! caches its [`PacketAnalysis`]; any later pass over the same frame returns
//! the cached analysis untouched.

use crate::association::{Association, AssociationMatcher, TagObservation};
use crate::checksum::{ChecksumResult, ChecksumStatus, ChecksumVerifier};
use crate::config::AnalyzerConfig;
use crate::errors::{ChunkError, Result};
use crate::reassembly::{FragmentAdd, FragmentKey, FragmentReassembler, ReassemblyOutcome};
use crate::sctp::{Chunk, ChunkType, DataChunk, IDataChunk, RawChunk, SctpHeader, SctpPacket};
use crate::tsn::{
    GapBlockIssue, HalfId, SackAnalysis, SackProcessor, TransmissionOutcome, TsnTracker,
};
use crate::types::{AssociationRef, Datagram, FrameId, FrameStamp};
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, instrument, trace, warn};

/// Processing state of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FrameState {
    NotSeen,
    /// First pass done, state mutated
    Analyzed,
    /// Revisited; served from the cache
    Replaying,
}

/// Everything learned from one datagram
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PacketAnalysis {
    pub frame: FrameId,
    pub source_port: u16,
    pub destination_port: u16,
    pub verification_tag: u32,
    pub checksum: ChecksumResult,
    /// `None` when unresolved or association indexing is off
    pub association: Option<AssociationRef>,
    pub chunks: Vec<ChunkAnalysis>,
    pub anomalies: Vec<Anomaly>,
}

impl PacketAnalysis {
    pub fn data(&self) -> impl Iterator<Item = &DataAnalysis> {
        self.chunks.iter().filter_map(|chunk| match chunk {
            ChunkAnalysis::Data(data) => Some(data),
            _ => None,
        })
    }

    pub fn sacks(&self) -> impl Iterator<Item = &SackAnalysis> {
        self.chunks.iter().filter_map(|chunk| match chunk {
            ChunkAnalysis::Sack(sack) => Some(sack),
            _ => None,
        })
    }
}

/// Per-chunk facts, in wire order
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum ChunkAnalysis {
    Data(DataAnalysis),
    Sack(SackAnalysis),
    Init {
        ack: bool,
        initiate_tag: u32,
        initial_tsn: u32,
        /// The initial TSN became the sender's TSN baseline
        baseline_set: bool,
    },
    Abort {
        reflected: bool,
    },
    ShutdownComplete {
        reflected: bool,
    },
    Other {
        chunk_type: u8,
        length: u16,
    },
    Malformed {
        chunk_type: u8,
        reason: String,
    },
}

/// Facts for one DATA or I-DATA chunk
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DataAnalysis {
    pub tsn: u32,
    pub i_data: bool,
    pub stream_id: u16,
    /// Stream sequence number (DATA) or message identifier (I-DATA)
    pub sequence: u32,
    pub unordered: bool,
    pub beginning: bool,
    pub ending: bool,
    pub length: usize,
    /// `None` when TSN analysis is off or the association is unresolved
    pub transmission: Option<TransmissionOutcome>,
    pub delivery: Delivery,
}

/// What happened to a chunk's user data
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Delivery {
    /// Unfragmented message
    Message { data: Bytes },
    /// Last missing fragment arrived
    Reassembled { data: Bytes, frames: Vec<FrameId> },
    /// First fragment passed on as-is (reassembly disabled)
    FirstFragment { data: Bytes },
    AwaitingFragments,
    PartOfMessage { completed_in: FrameId },
    DuplicateFragment { original_frame: FrameId },
    /// Retransmitted data is not delivered again
    Retransmission,
    /// Non-first fragment while reassembly is disabled
    Suppressed,
}

/// Recoverable findings; analysis always continues
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Anomaly {
    TruncatedCapture {
        captured: usize,
        reported: usize,
    },
    ChunkLength {
        offset: usize,
        declared: u16,
        remaining: usize,
    },
    MalformedChunk {
        offset: usize,
        chunk_type: u8,
        reason: String,
    },
    /// Bytes after the last chunk, too short for a chunk header
    TrailingBytes {
        length: usize,
    },
    /// INIT, INIT-ACK or SHUTDOWN-COMPLETE bundled with other chunks
    IllegalBundling {
        chunk_type: u8,
    },
    RetransmissionLimit {
        tsn: u32,
        count: u32,
    },
    RetransmittedAfterAck {
        tsn: u32,
        acked_in: FrameId,
    },
    GapBlock(GapBlockIssue),
    GapAckThreshold {
        gap_acked: u32,
    },
    DuplicateFragment {
        tsn: u32,
        original_frame: FrameId,
    },
}

/// User data of a DATA or I-DATA chunk
struct UserData {
    tsn: u32,
    i_data: bool,
    stream_id: u16,
    sequence: u32,
    /// Reassembly order: TSN or fragment sequence number
    position: u32,
    unordered: bool,
    beginning: bool,
    ending: bool,
    payload: Bytes,
}

impl From<DataChunk> for UserData {
    fn from(chunk: DataChunk) -> Self {
        Self {
            tsn: chunk.tsn,
            i_data: false,
            stream_id: chunk.stream_id,
            sequence: u32::from(chunk.stream_seq),
            position: chunk.tsn,
            unordered: chunk.unordered,
            beginning: chunk.beginning,
            ending: chunk.ending,
            payload: chunk.user_data,
        }
    }
}

impl From<IDataChunk> for UserData {
    fn from(chunk: IDataChunk) -> Self {
        Self {
            tsn: chunk.tsn,
            i_data: true,
            stream_id: chunk.stream_id,
            sequence: chunk.message_id,
            position: chunk.fsn(),
            unordered: chunk.unordered,
            beginning: chunk.beginning,
            ending: chunk.ending,
            payload: chunk.user_data,
        }
    }
}

#[derive(Debug)]
struct FrameEntry {
    state: FrameState,
    analysis: PacketAnalysis,
}

/// Session context for SCTP analysis
#[derive(Debug)]
pub struct SctpAnalyzer {
    config: AnalyzerConfig,
    matcher: AssociationMatcher,
    tracker: TsnTracker,
    sacks: SackProcessor,
    reassembler: FragmentReassembler,
    frames: HashMap<FrameId, FrameEntry>,
}

impl SctpAnalyzer {
    pub fn new(config: AnalyzerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            sacks: SackProcessor::new(&config.tsn),
            config,
            matcher: AssociationMatcher::new(),
            tracker: TsnTracker::new(),
            reassembler: FragmentReassembler::new(),
            frames: HashMap::new(),
        })
    }

    /// Drop all session state, e.g. when a new capture is opened
    pub fn reset(&mut self) {
        debug!(
            associations = self.matcher.len(),
            frames = self.frames.len(),
            "Resetting analyzer session"
        );
        self.matcher = AssociationMatcher::new();
        self.tracker = TsnTracker::new();
        self.reassembler = FragmentReassembler::new();
        self.frames.clear();
    }

    pub fn config(&self) -> &AnalyzerConfig {
        &self.config
    }

    pub fn frame_state(&self, frame: FrameId) -> FrameState {
        self.frames
            .get(&frame)
            .map_or(FrameState::NotSeen, |entry| entry.state)
    }

    pub fn associations(&self) -> &[Association] {
        self.matcher.associations()
    }

    pub fn tracker(&self) -> &TsnTracker {
        &self.tracker
    }

    pub fn reassembler(&self) -> &FragmentReassembler {
        &self.reassembler
    }

    /// Analyze a datagram, or return the analysis of an earlier pass.
    ///
    /// Only a datagram too short for the common header is an error; the
    /// session is left untouched in that case.
    #[instrument(skip(self, datagram), fields(frame = datagram.frame, len = datagram.data.len()))]
    pub fn process(&mut self, datagram: &Datagram) -> Result<PacketAnalysis> {
        if let Some(entry) = self.frames.get_mut(&datagram.frame) {
            trace!(state = ?entry.state, "Replaying frame");
            entry.state = FrameState::Replaying;
            return Ok(entry.analysis.clone());
        }

        let analysis = self.analyze(datagram)?;
        self.frames.insert(
            datagram.frame,
            FrameEntry {
                state: FrameState::Analyzed,
                analysis: analysis.clone(),
            },
        );
        Ok(analysis)
    }

    fn analyze(&mut self, datagram: &Datagram) -> Result<PacketAnalysis> {
        let packet = SctpPacket::decode(&datagram.data).map_err(|e| {
            warn!(error = %e, "Dropping datagram");
            e
        })?;
        let stamp = FrameStamp::new(datagram.frame, datagram.timestamp);
        let mut anomalies = Vec::new();

        let checksum = ChecksumVerifier::verify(&datagram.data, datagram.reported_len, self.config.checksum);
        if checksum.status == ChecksumStatus::Mismatched {
            warn!(
                declared = checksum.declared,
                calculated = ?checksum.calculated,
                "Checksum mismatch"
            );
            metrics::counter!("sctp_checksum_mismatches_total").increment(1);
        }
        if datagram.is_truncated() {
            anomalies.push(Anomaly::TruncatedCapture {
                captured: datagram.data.len(),
                reported: datagram.reported_len,
            });
        }

        if let Some(ChunkError::InvalidLength {
            offset,
            declared,
            remaining,
        }) = packet.length_error
        {
            warn!(offset, declared, remaining, "Bad chunk length, rest of packet skipped");
            metrics::counter!("sctp_malformed_chunks_total").increment(1);
            anomalies.push(Anomaly::ChunkLength {
                offset,
                declared,
                remaining,
            });
        }
        if packet.trailing > 0 {
            anomalies.push(Anomaly::TrailingBytes {
                length: packet.trailing,
            });
        }

        let decoded: Vec<(&RawChunk, std::result::Result<Chunk, ChunkError>)> = packet
            .chunks
            .iter()
            .map(|raw| (raw, Chunk::decode(raw)))
            .collect();
        check_bundling(&packet.chunks, &mut anomalies);

        let association = if self.config.association_indexing() {
            let obs = observe(datagram, &packet.header, decoded.iter().filter_map(|(_, c)| c.as_ref().ok()));
            self.matcher.resolve(datagram.frame, false, &obs)
        } else {
            None
        };
        let sender = match association {
            Some(assoc) if self.config.tsn.enabled => Some(self.tracker.half_for(assoc)),
            _ => None,
        };

        let mut chunks = Vec::with_capacity(decoded.len());
        for (raw, result) in decoded {
            let chunk = match result {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!(offset = raw.offset, error = %e, "Undecodable chunk");
                    metrics::counter!("sctp_malformed_chunks_total").increment(1);
                    anomalies.push(Anomaly::MalformedChunk {
                        offset: raw.offset,
                        chunk_type: raw.header.chunk_type,
                        reason: e.to_string(),
                    });
                    chunks.push(ChunkAnalysis::Malformed {
                        chunk_type: raw.header.chunk_type,
                        reason: e.to_string(),
                    });
                    continue;
                }
            };

            let analysis = match chunk {
                Chunk::Data(data) => ChunkAnalysis::Data(self.analyze_data(
                    sender,
                    &packet.header,
                    data.into(),
                    stamp,
                    &mut anomalies,
                )),
                Chunk::IData(data) => ChunkAnalysis::Data(self.analyze_data(
                    sender,
                    &packet.header,
                    data.into(),
                    stamp,
                    &mut anomalies,
                )),
                Chunk::Sack(sack) | Chunk::NrSack(sack) => {
                    let non_renegable = raw.header.chunk_type == ChunkType::NrSack as u8;
                    let peer = sender.and_then(|id| self.tracker.peer_mut(id));
                    let result = self.sacks.process(peer, &sack, non_renegable, stamp);

                    anomalies.extend(result.gap_block_issues.iter().cloned().map(Anomaly::GapBlock));
                    if result.gap_ack_threshold_exceeded {
                        anomalies.push(Anomaly::GapAckThreshold {
                            gap_acked: result.gap_acked_tsns,
                        });
                    }
                    ChunkAnalysis::Sack(result)
                }
                Chunk::Init(init) | Chunk::InitAck(init) => {
                    let baseline_set = sender
                        .and_then(|id| self.tracker.half_mut(id))
                        .is_some_and(|half| half.set_baseline(init.initial_tsn));
                    ChunkAnalysis::Init {
                        ack: raw.header.chunk_type == ChunkType::InitAck as u8,
                        initiate_tag: init.initiate_tag,
                        initial_tsn: init.initial_tsn,
                        baseline_set,
                    }
                }
                Chunk::Abort { reflected } => ChunkAnalysis::Abort { reflected },
                Chunk::ShutdownComplete { reflected } => ChunkAnalysis::ShutdownComplete { reflected },
                Chunk::Other { chunk_type, length } => ChunkAnalysis::Other { chunk_type, length },
            };
            chunks.push(analysis);
        }

        if !anomalies.is_empty() {
            debug!(count = anomalies.len(), "Packet anomalies");
        }

        Ok(PacketAnalysis {
            frame: datagram.frame,
            source_port: packet.header.source_port,
            destination_port: packet.header.destination_port,
            verification_tag: packet.header.verification_tag,
            checksum,
            association,
            chunks,
            anomalies,
        })
    }

    fn analyze_data(
        &mut self,
        sender: Option<HalfId>,
        header: &SctpHeader,
        data: UserData,
        stamp: FrameStamp,
        anomalies: &mut Vec<Anomaly>,
    ) -> DataAnalysis {
        let max_tracked = self.config.tsn.max_retransmissions_tracked;
        let transmission = sender
            .and_then(|id| self.tracker.half_mut(id))
            .map(|half| half.record_transmission(data.tsn, stamp, max_tracked));

        if let Some(retrans) = transmission.as_ref().and_then(|t| t.retransmission.as_ref()) {
            if let Some(acked_in) = retrans.after_ack_in {
                anomalies.push(Anomaly::RetransmittedAfterAck {
                    tsn: data.tsn,
                    acked_in,
                });
            }
            if retrans.history_truncated && retrans.count as usize == max_tracked + 1 {
                anomalies.push(Anomaly::RetransmissionLimit {
                    tsn: data.tsn,
                    count: retrans.count,
                });
            }
        }

        let retransmitted = transmission
            .as_ref()
            .is_some_and(TransmissionOutcome::is_retransmission);
        let delivery = if retransmitted {
            Delivery::Retransmission
        } else {
            self.deliver(header, &data, stamp.frame, anomalies)
        };

        DataAnalysis {
            tsn: data.tsn,
            i_data: data.i_data,
            stream_id: data.stream_id,
            sequence: data.sequence,
            unordered: data.unordered,
            beginning: data.beginning,
            ending: data.ending,
            length: data.payload.len(),
            transmission,
            delivery,
        }
    }

    fn deliver(
        &mut self,
        header: &SctpHeader,
        data: &UserData,
        frame: FrameId,
        anomalies: &mut Vec<Anomaly>,
    ) -> Delivery {
        if data.beginning && data.ending {
            return Delivery::Message {
                data: data.payload.clone(),
            };
        }
        if !self.config.reassembly.enabled {
            return if data.beginning {
                Delivery::FirstFragment {
                    data: data.payload.clone(),
                }
            } else {
                Delivery::Suppressed
            };
        }

        let key = FragmentKey {
            source_port: header.source_port,
            destination_port: header.destination_port,
            vtag: header.verification_tag,
            stream_id: data.stream_id,
            sequence: data.sequence,
            unordered: data.unordered,
        };
        let added = self.reassembler.add_fragment(
            &key,
            data.position,
            data.beginning,
            data.ending,
            data.payload.clone(),
            frame,
        );
        if let FragmentAdd::Duplicate { original_frame } = added {
            anomalies.push(Anomaly::DuplicateFragment {
                tsn: data.tsn,
                original_frame,
            });
            return Delivery::DuplicateFragment { original_frame };
        }

        match self.reassembler.try_reassemble(&key, data.position, frame) {
            ReassemblyOutcome::Complete(message) => Delivery::Reassembled {
                data: message.data,
                frames: message.frames,
            },
            ReassemblyOutcome::AwaitingMore => Delivery::AwaitingFragments,
            ReassemblyOutcome::PartOf { completed_in } => Delivery::PartOfMessage { completed_in },
        }
    }
}

/// Tags visible on a packet, attributed to their owning endpoint
fn observe<'a>(
    datagram: &Datagram,
    header: &SctpHeader,
    chunks: impl Iterator<Item = &'a Chunk>,
) -> TagObservation {
    let mut obs = TagObservation {
        source_port: header.source_port,
        destination_port: header.destination_port,
        source: datagram.source,
        destination: datagram.destination,
        destination_tag: header.verification_tag,
        source_tag: 0,
    };

    for chunk in chunks {
        match chunk {
            Chunk::Init(init) | Chunk::InitAck(init) => obs.source_tag = init.initiate_tag,
            Chunk::Abort { reflected: true } | Chunk::ShutdownComplete { reflected: true } => {
                obs.source_tag = header.verification_tag;
                obs.destination_tag = 0;
            }
            _ => {}
        }
    }
    obs
}

fn check_bundling(chunks: &[RawChunk], anomalies: &mut Vec<Anomaly>) {
    if chunks.len() < 2 {
        return;
    }
    for raw in chunks {
        let alone_only = matches!(
            ChunkType::from_u8(raw.header.chunk_type),
            Some(ChunkType::Init | ChunkType::InitAck | ChunkType::ShutdownComplete)
        );
        if alone_only {
            anomalies.push(Anomaly::IllegalBundling {
                chunk_type: raw.header.chunk_type,
            });
        }
    }
}

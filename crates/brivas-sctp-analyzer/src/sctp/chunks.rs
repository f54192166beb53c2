//! SCTP chunk encoding/decoding

use super::{flags, ChunkType};
use crate::errors::ChunkError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// SCTP Common Header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SctpHeader {
    pub source_port: u16,
    pub destination_port: u16,
    pub verification_tag: u32,
    pub checksum: u32,
}

impl SctpHeader {
    pub const SIZE: usize = 12;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.source_port);
        buf.put_u16(self.destination_port);
        buf.put_u32(self.verification_tag);
        buf.put_u32(self.checksum);
    }

    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }
        Some(Self {
            source_port: buf.get_u16(),
            destination_port: buf.get_u16(),
            verification_tag: buf.get_u32(),
            checksum: buf.get_u32(),
        })
    }
}

/// SCTP Chunk Header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    pub chunk_type: u8,
    pub flags: u8,
    pub length: u16,
}

impl ChunkHeader {
    pub const SIZE: usize = 4;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.chunk_type);
        buf.put_u8(self.flags);
        buf.put_u16(self.length);
    }

    pub fn decode(buf: &mut Bytes) -> Option<Self> {
        if buf.remaining() < Self::SIZE {
            return None;
        }
        Some(Self {
            chunk_type: buf.get_u8(),
            flags: buf.get_u8(),
            length: buf.get_u16(),
        })
    }
}

/// One chunk as found on the wire, value not yet interpreted
#[derive(Debug, Clone)]
pub struct RawChunk {
    /// Offset of the chunk header within the datagram
    pub offset: usize,
    pub header: ChunkHeader,
    /// Chunk value, without header and padding
    pub value: Bytes,
}

/// A datagram split into its common header and chunks
#[derive(Debug, Clone)]
pub struct SctpPacket {
    pub header: SctpHeader,
    pub chunks: Vec<RawChunk>,
    /// Corrupt chunk length that stopped the chunk walk
    pub length_error: Option<ChunkError>,
    /// Bytes after the last chunk too short to hold a chunk header
    pub trailing: usize,
}

impl SctpPacket {
    /// Split a datagram into chunks.
    ///
    /// Only a datagram shorter than the common header is an error; a bad
    /// chunk length ends the walk and is reported in `length_error`.
    pub fn decode(datagram: &Bytes) -> Result<Self, ChunkError> {
        let mut buf = datagram.clone();
        let header = SctpHeader::decode(&mut buf)
            .ok_or(ChunkError::TruncatedHeader(datagram.len()))?;

        let mut chunks = Vec::new();
        let mut length_error = None;
        let mut offset = SctpHeader::SIZE;

        while buf.remaining() >= ChunkHeader::SIZE {
            let remaining = buf.remaining();
            let mut peek = buf.clone();
            let chunk_header = match ChunkHeader::decode(&mut peek) {
                Some(h) => h,
                None => break,
            };

            let length = chunk_header.length as usize;
            if length < ChunkHeader::SIZE || length > remaining {
                length_error = Some(ChunkError::InvalidLength {
                    offset,
                    declared: chunk_header.length,
                    remaining,
                });
                break;
            }

            buf.advance(ChunkHeader::SIZE);
            let value = buf.split_to(length - ChunkHeader::SIZE);

            // The last chunk of a datagram may omit its padding
            let padding = ((4 - length % 4) % 4).min(buf.remaining());
            buf.advance(padding);

            chunks.push(RawChunk {
                offset,
                header: chunk_header,
                value,
            });
            offset += length + padding;
        }

        let trailing = if length_error.is_some() { 0 } else { buf.remaining() };

        Ok(Self {
            header,
            chunks,
            length_error,
            trailing,
        })
    }
}

/// Decoded chunk, one variant per chunk type the analysis cares about
#[derive(Debug, Clone)]
pub enum Chunk {
    Data(DataChunk),
    IData(IDataChunk),
    Sack(SackChunk),
    NrSack(SackChunk),
    Init(InitChunk),
    InitAck(InitChunk),
    Abort { reflected: bool },
    ShutdownComplete { reflected: bool },
    Other { chunk_type: u8, length: u16 },
}

impl Chunk {
    pub fn decode(raw: &RawChunk) -> Result<Self, ChunkError> {
        let value = raw.value.clone();
        let flags = raw.header.flags;

        Ok(match ChunkType::from_u8(raw.header.chunk_type) {
            Some(ChunkType::Data) => Chunk::Data(DataChunk::decode(flags, value)?),
            Some(ChunkType::IData) => Chunk::IData(IDataChunk::decode(flags, value)?),
            Some(ChunkType::Sack) => Chunk::Sack(SackChunk::decode(value, false)?),
            Some(ChunkType::NrSack) => Chunk::NrSack(SackChunk::decode(value, true)?),
            Some(ChunkType::Init) => Chunk::Init(InitChunk::decode(ChunkType::Init, value)?),
            Some(ChunkType::InitAck) => {
                Chunk::InitAck(InitChunk::decode(ChunkType::InitAck, value)?)
            }
            Some(ChunkType::Abort) => Chunk::Abort {
                reflected: flags & flags::T_BIT != 0,
            },
            Some(ChunkType::ShutdownComplete) => Chunk::ShutdownComplete {
                reflected: flags & flags::T_BIT != 0,
            },
            _ => Chunk::Other {
                chunk_type: raw.header.chunk_type,
                length: raw.header.length,
            },
        })
    }
}

fn too_short(chunk_type: ChunkType, value: &Bytes, minimum_value: usize) -> ChunkError {
    ChunkError::TooShort {
        chunk_type: chunk_type as u8,
        length: ChunkHeader::SIZE + value.len(),
        minimum: ChunkHeader::SIZE + minimum_value,
    }
}

/// Write a chunk header, value and padding
fn put_chunk(buf: &mut BytesMut, chunk_type: ChunkType, flags: u8, value: &[u8]) {
    let header = ChunkHeader {
        chunk_type: chunk_type as u8,
        flags,
        length: (ChunkHeader::SIZE + value.len()) as u16,
    };
    header.encode(buf);
    buf.put_slice(value);

    // Pad to 4-byte boundary
    let padding = (4 - (value.len() % 4)) % 4;
    for _ in 0..padding {
        buf.put_u8(0);
    }
}

/// DATA Chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataChunk {
    pub tsn: u32,
    pub stream_id: u16,
    pub stream_seq: u16,
    pub ppid: u32,
    pub user_data: Bytes,
    pub unordered: bool,
    pub beginning: bool,
    pub ending: bool,
}

impl DataChunk {
    const FIXED: usize = 12;

    /// Calculate flags byte
    pub fn flags(&self) -> u8 {
        let mut f = 0u8;
        if self.unordered {
            f |= flags::UNORDERED;
        }
        if self.beginning {
            f |= flags::BEGIN;
        }
        if self.ending {
            f |= flags::END;
        }
        f
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut value = BytesMut::with_capacity(Self::FIXED + self.user_data.len());
        value.put_u32(self.tsn);
        value.put_u16(self.stream_id);
        value.put_u16(self.stream_seq);
        value.put_u32(self.ppid);
        value.put_slice(&self.user_data);
        put_chunk(buf, ChunkType::Data, self.flags(), &value);
    }

    pub fn decode(flags: u8, mut data: Bytes) -> Result<Self, ChunkError> {
        if data.remaining() < Self::FIXED {
            return Err(too_short(ChunkType::Data, &data, Self::FIXED));
        }

        let tsn = data.get_u32();
        let stream_id = data.get_u16();
        let stream_seq = data.get_u16();
        let ppid = data.get_u32();

        Ok(Self {
            tsn,
            stream_id,
            stream_seq,
            ppid,
            user_data: data,
            unordered: (flags & flags::UNORDERED) != 0,
            beginning: (flags & flags::BEGIN) != 0,
            ending: (flags & flags::END) != 0,
        })
    }
}

/// I-DATA Chunk (RFC 8260)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IDataChunk {
    pub tsn: u32,
    pub stream_id: u16,
    pub message_id: u32,
    /// PPID on the first fragment, Fragment Sequence Number otherwise
    pub ppid_or_fsn: u32,
    pub user_data: Bytes,
    pub unordered: bool,
    pub beginning: bool,
    pub ending: bool,
    pub immediate: bool,
}

impl IDataChunk {
    const FIXED: usize = 16;

    /// Fragment Sequence Number; the first fragment is implicitly zero
    pub fn fsn(&self) -> u32 {
        if self.beginning {
            0
        } else {
            self.ppid_or_fsn
        }
    }

    pub fn ppid(&self) -> Option<u32> {
        self.beginning.then_some(self.ppid_or_fsn)
    }

    pub fn flags(&self) -> u8 {
        let mut f = 0u8;
        if self.immediate {
            f |= flags::IMMEDIATE;
        }
        if self.unordered {
            f |= flags::UNORDERED;
        }
        if self.beginning {
            f |= flags::BEGIN;
        }
        if self.ending {
            f |= flags::END;
        }
        f
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        let mut value = BytesMut::with_capacity(Self::FIXED + self.user_data.len());
        value.put_u32(self.tsn);
        value.put_u16(self.stream_id);
        value.put_u16(0); // Reserved
        value.put_u32(self.message_id);
        value.put_u32(self.ppid_or_fsn);
        value.put_slice(&self.user_data);
        put_chunk(buf, ChunkType::IData, self.flags(), &value);
    }

    pub fn decode(flags: u8, mut data: Bytes) -> Result<Self, ChunkError> {
        if data.remaining() < Self::FIXED {
            return Err(too_short(ChunkType::IData, &data, Self::FIXED));
        }

        let tsn = data.get_u32();
        let stream_id = data.get_u16();
        let _reserved = data.get_u16();
        let message_id = data.get_u32();
        let ppid_or_fsn = data.get_u32();

        Ok(Self {
            tsn,
            stream_id,
            message_id,
            ppid_or_fsn,
            user_data: data,
            unordered: (flags & flags::UNORDERED) != 0,
            beginning: (flags & flags::BEGIN) != 0,
            ending: (flags & flags::END) != 0,
            immediate: (flags & flags::IMMEDIATE) != 0,
        })
    }
}

/// Gap Ack Block, offsets relative to the cumulative TSN ack
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct GapBlock {
    pub start: u16,
    pub end: u16,
}

/// SACK or NR-SACK Chunk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SackChunk {
    pub cumulative_tsn_ack: u32,
    pub a_rwnd: u32,
    pub gap_blocks: Vec<GapBlock>,
    /// Non-renegable gap blocks (NR-SACK only)
    pub nr_gap_blocks: Vec<GapBlock>,
    pub duplicate_tsns: Vec<u32>,
}

impl SackChunk {
    const FIXED: usize = 12;
    const NR_FIXED: usize = 16;

    pub fn encode(&self, buf: &mut BytesMut, non_renegable: bool) {
        let mut value = BytesMut::new();
        value.put_u32(self.cumulative_tsn_ack);
        value.put_u32(self.a_rwnd);
        value.put_u16(self.gap_blocks.len() as u16);
        if non_renegable {
            value.put_u16(self.nr_gap_blocks.len() as u16);
        }
        value.put_u16(self.duplicate_tsns.len() as u16);
        if non_renegable {
            value.put_u16(0); // Reserved
        }
        for block in &self.gap_blocks {
            value.put_u16(block.start);
            value.put_u16(block.end);
        }
        if non_renegable {
            for block in &self.nr_gap_blocks {
                value.put_u16(block.start);
                value.put_u16(block.end);
            }
        }
        for tsn in &self.duplicate_tsns {
            value.put_u32(*tsn);
        }
        let chunk_type = if non_renegable {
            ChunkType::NrSack
        } else {
            ChunkType::Sack
        };
        put_chunk(buf, chunk_type, 0, &value);
    }

    pub fn decode(mut data: Bytes, non_renegable: bool) -> Result<Self, ChunkError> {
        let (chunk_type, fixed) = if non_renegable {
            (ChunkType::NrSack, Self::NR_FIXED)
        } else {
            (ChunkType::Sack, Self::FIXED)
        };
        if data.remaining() < fixed {
            return Err(too_short(chunk_type, &data, fixed));
        }
        let original = data.clone();

        let cumulative_tsn_ack = data.get_u32();
        let a_rwnd = data.get_u32();
        let num_gap = data.get_u16() as usize;
        let num_nr_gap = if non_renegable {
            data.get_u16() as usize
        } else {
            0
        };
        let num_dup = data.get_u16() as usize;
        if non_renegable {
            let _reserved = data.get_u16();
        }

        let needed = fixed + (num_gap + num_nr_gap) * 4 + num_dup * 4;
        if original.len() < needed {
            return Err(too_short(chunk_type, &original, needed));
        }

        let mut read_blocks = |count: usize| -> Vec<GapBlock> {
            (0..count)
                .map(|_| GapBlock {
                    start: data.get_u16(),
                    end: data.get_u16(),
                })
                .collect()
        };
        let gap_blocks = read_blocks(num_gap);
        let nr_gap_blocks = read_blocks(num_nr_gap);
        let duplicate_tsns = (0..num_dup).map(|_| data.get_u32()).collect();

        Ok(Self {
            cumulative_tsn_ack,
            a_rwnd,
            gap_blocks,
            nr_gap_blocks,
            duplicate_tsns,
        })
    }
}

/// INIT / INIT-ACK fixed parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitChunk {
    pub initiate_tag: u32,
    pub a_rwnd: u32,
    pub outbound_streams: u16,
    pub inbound_streams: u16,
    pub initial_tsn: u32,
}

impl InitChunk {
    const FIXED: usize = 16;

    pub fn encode(&self, buf: &mut BytesMut, ack: bool) {
        let mut value = BytesMut::with_capacity(Self::FIXED);
        value.put_u32(self.initiate_tag);
        value.put_u32(self.a_rwnd);
        value.put_u16(self.outbound_streams);
        value.put_u16(self.inbound_streams);
        value.put_u32(self.initial_tsn);
        let chunk_type = if ack { ChunkType::InitAck } else { ChunkType::Init };
        put_chunk(buf, chunk_type, 0, &value);
    }

    pub fn decode(chunk_type: ChunkType, mut data: Bytes) -> Result<Self, ChunkError> {
        if data.remaining() < Self::FIXED {
            return Err(too_short(chunk_type, &data, Self::FIXED));
        }
        // Optional/variable parameters are not needed for analysis
        Ok(Self {
            initiate_tag: data.get_u32(),
            a_rwnd: data.get_u32(),
            outbound_streams: data.get_u16(),
            inbound_streams: data.get_u16(),
            initial_tsn: data.get_u32(),
        })
    }
}

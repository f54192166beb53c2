//! SCTP wire format
//!
//! Only the fields the stateful analysis consumes are decoded; everything
//! else is carried as an opaque chunk.

mod chunks;

pub use chunks::{
    Chunk, ChunkHeader, DataChunk, GapBlock, IDataChunk, InitChunk, RawChunk, SackChunk,
    SctpHeader, SctpPacket,
};

/// SCTP chunk types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ChunkType {
    Data = 0,
    Init = 1,
    InitAck = 2,
    Sack = 3,
    Heartbeat = 4,
    HeartbeatAck = 5,
    Abort = 6,
    Shutdown = 7,
    ShutdownAck = 8,
    Error = 9,
    CookieEcho = 10,
    CookieAck = 11,
    EcnEcho = 12,
    Cwr = 13,
    ShutdownComplete = 14,
    Auth = 15,
    NrSack = 16,
    IData = 64,
    AsconfAck = 128,
    ReConfig = 130,
    Pad = 132,
    ForwardTsn = 192,
    Asconf = 193,
    IForwardTsn = 194,
}

impl ChunkType {
    pub fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            0 => Self::Data,
            1 => Self::Init,
            2 => Self::InitAck,
            3 => Self::Sack,
            4 => Self::Heartbeat,
            5 => Self::HeartbeatAck,
            6 => Self::Abort,
            7 => Self::Shutdown,
            8 => Self::ShutdownAck,
            9 => Self::Error,
            10 => Self::CookieEcho,
            11 => Self::CookieAck,
            12 => Self::EcnEcho,
            13 => Self::Cwr,
            14 => Self::ShutdownComplete,
            15 => Self::Auth,
            16 => Self::NrSack,
            64 => Self::IData,
            128 => Self::AsconfAck,
            130 => Self::ReConfig,
            132 => Self::Pad,
            192 => Self::ForwardTsn,
            193 => Self::Asconf,
            194 => Self::IForwardTsn,
            _ => return None,
        })
    }
}

/// DATA / I-DATA flag bits
pub mod flags {
    pub const END: u8 = 0x01;
    pub const BEGIN: u8 = 0x02;
    pub const UNORDERED: u8 = 0x04;
    pub const IMMEDIATE: u8 = 0x08;
    /// ABORT / SHUTDOWN-COMPLETE: verification tag is the sender's own
    pub const T_BIT: u8 = 0x01;
}

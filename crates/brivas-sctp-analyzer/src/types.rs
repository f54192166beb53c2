//! Common types used across the analyzer

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::IpAddr;

/// Monotonically increasing capture frame number
pub type FrameId = u32;

/// Capture timestamp
pub type Timestamp = DateTime<Utc>;

/// Direction of a packet relative to the first packet seen on its association
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum Direction {
    /// Same orientation as the packet that created the association
    Forward,
    /// Ports (and tags) reversed
    Reverse,
}

impl Direction {
    pub fn reverse(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
        }
    }
}

/// Resolved association for one packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct AssociationRef {
    pub index: u32,
    pub direction: Direction,
}

/// One transport datagram handed to the analyzer
#[derive(Debug, Clone)]
pub struct Datagram {
    pub frame: FrameId,
    pub timestamp: Timestamp,
    pub source: IpAddr,
    pub destination: IpAddr,
    /// Captured bytes, starting at the SCTP common header
    pub data: Bytes,
    /// On-wire length; larger than `data.len()` for a truncated capture
    pub reported_len: usize,
}

impl Datagram {
    pub fn new(
        frame: FrameId,
        timestamp: Timestamp,
        source: IpAddr,
        destination: IpAddr,
        data: Bytes,
    ) -> Self {
        let reported_len = data.len();
        Self {
            frame,
            timestamp,
            source,
            destination,
            data,
            reported_len,
        }
    }

    /// Mark the capture as truncated
    pub fn with_reported_len(mut self, reported_len: usize) -> Self {
        self.reported_len = reported_len;
        self
    }

    pub fn is_truncated(&self) -> bool {
        self.data.len() < self.reported_len
    }
}

/// First transmission, retransmission or acknowledgment of a TSN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FrameStamp {
    pub frame: FrameId,
    pub timestamp: Timestamp,
}

impl FrameStamp {
    pub fn new(frame: FrameId, timestamp: Timestamp) -> Self {
        Self { frame, timestamp }
    }
}

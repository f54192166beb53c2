//! # Brivas SCTP Analyzer
//!
//! Stateful analysis of captured SCTP traffic:
//!
//! - **Association matching** - stable association identity from partial
//!   verification tag information
//! - **TSN tracking** - first transmission, retransmissions, cumulative and
//!   gap acknowledgments, RTT and reneging
//! - **Reassembly** - fragmented DATA / I-DATA user messages, including
//!   TSN wraparound
//! - **Checksums** - CRC32c and Adler-32 verification
//!
//! Every datagram may be handed in twice (analysis pass, then replay); the
//! replay returns the first pass's results without touching session state.
//!
//! ## Example
//! ```rust,ignore
//! use brivas_sctp_analyzer::{AnalyzerConfig, Datagram, SctpAnalyzer};
//!
//! let mut analyzer = SctpAnalyzer::new(AnalyzerConfig::default())?;
//! let analysis = analyzer.process(&Datagram::new(1, ts, src, dst, bytes))?;
//! println!("{}", serde_json::to_string(&analysis)?);
//! ```

pub mod analyzer;
pub mod association;
pub mod checksum;
pub mod config;
pub mod errors;
pub mod reassembly;
pub mod sctp;
pub mod telemetry;
pub mod tsn;
pub mod types;


// Re-exports
pub use analyzer::{Anomaly, ChunkAnalysis, DataAnalysis, Delivery, FrameState, PacketAnalysis, SctpAnalyzer};
pub use checksum::{ChecksumMethod, ChecksumResult, ChecksumStatus, ChecksumVerifier};
pub use config::AnalyzerConfig;
pub use errors::{AnalyzerError, ChunkError, Result};
pub use types::*;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

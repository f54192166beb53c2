//! Error types for the SCTP analyzer

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, AnalyzerError>;

/// Top-level analyzer error
#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("Malformed packet: {0}")]
    Malformed(#[from] ChunkError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

/// Wire decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("Datagram too short for common header: {0} bytes")]
    TruncatedHeader(usize),

    #[error("Chunk length {declared} invalid at offset {offset} ({remaining} bytes remaining)")]
    InvalidLength {
        offset: usize,
        declared: u16,
        remaining: usize,
    },

    #[error("Chunk type {chunk_type} too short: {length} bytes, need {minimum}")]
    TooShort {
        chunk_type: u8,
        length: usize,
        minimum: usize,
    },
}

impl From<config::ConfigError> for AnalyzerError {
    fn from(e: config::ConfigError) -> Self {
        AnalyzerError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for AnalyzerError {
    fn from(e: serde_json::Error) -> Self {
        AnalyzerError::Config(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AnalyzerConfig;

    fn header(len: usize) -> std::result::Result<(), ChunkError> {
        Err(ChunkError::TruncatedHeader(len))
    }

    fn decode(len: usize) -> Result<()> {
        header(len)?;
        Ok(())
    }

    #[test]
    fn test_chunk_error_converts_to_malformed() {
        let err = decode(7).unwrap_err();
        assert!(matches!(err, AnalyzerError::Malformed(ChunkError::TruncatedHeader(7))));
        assert_eq!(
            err.to_string(),
            "Malformed packet: Datagram too short for common header: 7 bytes"
        );
    }

    #[test]
    fn test_bad_json_is_config_error() {
        let err = AnalyzerConfig::from_json("not json").unwrap_err();
        assert!(matches!(err, AnalyzerError::Config(_)));
    }
}

//! Analyzer configuration

use crate::checksum::ChecksumMethod;
use crate::errors::{AnalyzerError, Result};
use crate::telemetry::TelemetryConfig;
use serde::{Deserialize, Serialize};

/// Environment variable prefix for overrides (`SCTP_ANALYZER__TSN__ACK_SPAN_LIMIT=...`)
pub const ENV_PREFIX: &str = "SCTP_ANALYZER";

/// Complete analyzer configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalyzerConfig {
    /// Checksum verification method
    pub checksum: ChecksumMethod,
    /// Association matching
    pub association: AssociationConfig,
    /// TSN analysis
    pub tsn: TsnAnalysisConfig,
    /// Message reassembly
    pub reassembly: ReassemblyConfig,
    /// Logging
    pub telemetry: TelemetryConfig,
}

/// Association matching configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AssociationConfig {
    /// Assign association indices to packets
    pub enable_indexing: bool,
}

/// TSN analysis configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TsnAnalysisConfig {
    /// Track transmissions and acknowledgments (requires association indexing)
    pub enabled: bool,
    /// Retransmissions remembered per TSN; the counter keeps going past it
    pub max_retransmissions_tracked: usize,
    /// Largest relative TSN span walked for a single ack
    pub ack_span_limit: u32,
    /// Gap-acked TSN count per SACK above which an anomaly is reported
    pub gap_ack_warning_threshold: u32,
}

/// Reassembly configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReassemblyConfig {
    /// Reassemble fragmented user messages
    pub enabled: bool,
}

impl Default for AssociationConfig {
    fn default() -> Self {
        Self {
            enable_indexing: true,
        }
    }
}

impl Default for TsnAnalysisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retransmissions_tracked: 100,
            ack_span_limit: 5000,
            gap_ack_warning_threshold: 100,
        }
    }
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

impl AnalyzerConfig {
    /// Load configuration from file, with environment overrides
    pub fn from_file(path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(path))
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Load configuration from environment only
    pub fn from_env() -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?;

        let cfg: Self = settings.try_deserialize()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parse configuration from a JSON document
    pub fn from_json(content: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(content)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Reject settings the analyzer cannot honour
    pub fn validate(&self) -> Result<()> {
        if self.tsn.enabled && !self.association.enable_indexing {
            return Err(AnalyzerError::Config(
                "TSN analysis requires association indexing".to_string(),
            ));
        }
        if self.tsn.ack_span_limit == 0 {
            return Err(AnalyzerError::Config(
                "ack_span_limit must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether association lookups are performed at all
    pub fn association_indexing(&self) -> bool {
        self.association.enable_indexing || self.tsn.enabled
    }
}

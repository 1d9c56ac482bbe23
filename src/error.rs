// Error kinds surfaced by the bandwidth controller

use crate::backends::{IpFamily, SinkError};

pub type Result<T> = std::result::Result<T, BandwidthError>;

#[derive(Debug, thiserror::Error)]
pub enum BandwidthError {
    /// The rule engine rejected a script or directive
    #[error("rule submission failed: {0}")]
    Sink(#[from] SinkError),

    /// Flush/declare of a costly chain did not fail exactly once
    #[error("chain {chain} in inconsistent state for {family}: {failures} of 2 prep directives failed")]
    TopologyInconsistency {
        chain: String,
        family: IpFamily,
        failures: usize,
    },

    /// Malformed, headerless or unpaired tether counter dump
    ///
    /// `raw` holds the dump exactly as the engine returned it; it is a
    /// diagnostic payload only.
    #[error("failed to parse {family} tether counters")]
    StatsParse { family: IpFamily, raw: String },

    /// Unfiltered tether stats query found no interface pair
    #[error("no tether interface pairs found")]
    EmptyStats,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("{0} not found")]
    NotFound(String),

    /// Writing a live quota threshold failed
    #[error("failed to update quota {name}: {source}")]
    QuotaUpdate {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Writing a response to the client failed
    #[error("failed to write response: {0}")]
    Io(#[from] std::io::Error),
}

impl BandwidthError {
    /// Raw engine text attached to a parse failure
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            BandwidthError::StatsParse { raw, .. } => Some(raw),
            _ => None,
        }
    }
}

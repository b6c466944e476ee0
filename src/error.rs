//! Error types for Zephy
//!
//! Every failure in the ingestion path degrades to "drop and log"; these
//! variants are what gets logged, counted, or (for operator actions such as
//! reload) returned to the caller.

use thiserror::Error;

use crate::metrics::DropReason;

/// Result type alias for ingestion operations
pub type Result<T> = std::result::Result<T, IngestError>;

/// Main error type for ingestion operations
#[derive(Error, Debug)]
pub enum IngestError {
    /// Message arrived on a topic absent from the current directory
    #[error("Unrecognized topic: {0}")]
    UnrecognizedTopic(String),

    /// Topic suffix is not a catalogued metric
    #[error("Unknown metric on topic: {0}")]
    UnknownMetric(String),

    /// Payload could not be read as a number
    #[error("Invalid payload on {topic}: {reason}")]
    InvalidPayload { topic: String, reason: String },

    /// Value refused by the range gate
    #[error("Rejected {metric} for device {device}: {reason}")]
    Rejected {
        device: String,
        metric: String,
        reason: String,
    },

    /// Transport rejected a subscribe call
    #[error("Subscribe failed for {count} topics: {reason}")]
    Subscribe { count: usize, reason: String },

    /// Store rejected a flushed reading
    #[error("Persist failed for device {device}: {reason}")]
    Persist { device: String, reason: String },

    /// Reload requested while the transport is not connected
    #[error("Transport not connected")]
    NotConnected,

    /// Registry query failed
    #[error("Registry error: {0}")]
    Registry(String),

    /// Transport-level failure other than subscribe
    #[error("Transport error: {0}")]
    Transport(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Service lifecycle misuse (double start, submit after stop)
    #[error("Service error: {0}")]
    Service(String),

    /// I/O error from file-backed collaborators
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding/decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

impl IngestError {
    /// Whether this error belongs to the silent drop-and-log class
    /// (as opposed to operator-facing errors returned from reload).
    pub fn is_drop(&self) -> bool {
        self.drop_reason().is_some()
    }

    /// Counter bucket for drop-class errors
    pub fn drop_reason(&self) -> Option<DropReason> {
        match self {
            Self::UnrecognizedTopic(_) => Some(DropReason::UnrecognizedTopic),
            Self::UnknownMetric(_) => Some(DropReason::UnknownMetric),
            Self::InvalidPayload { .. } => Some(DropReason::NotNumeric),
            Self::Rejected { .. } => Some(DropReason::OutOfRange),
            Self::Persist { .. } => Some(DropReason::PersistFailed),
            _ => None,
        }
    }
}

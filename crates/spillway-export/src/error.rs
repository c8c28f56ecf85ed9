//! Error types for export operations
//!
//! Includes error classification so callers can tell a stalled or
//! restarting source from a misuse of the API.

use serde::{Deserialize, Serialize};
use spillway_cluster::{ClusterError, PartitionId};
use thiserror::Error;

/// Error categories for metrics and alerting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Local buffer or sequence bookkeeping
    Storage,
    /// Mastership coordination and ack forwarding
    Coordination,
    /// Caller used the API incorrectly
    Usage,
    /// Invalid settings
    Configuration,
    /// The external sink failed
    Sink,
    /// Shutdown in progress
    Lifecycle,
}

/// Export-specific errors
#[derive(Error, Debug)]
pub enum ExportError {
    /// A poll was issued while another is still outstanding
    #[error("Poll already in progress for partition {partition} of {signature}")]
    PollInProgress {
        partition: PartitionId,
        signature: String,
    },

    /// No source is registered for the partition and table
    #[error("Unknown export source: partition {partition} of {signature}")]
    UnknownSource {
        partition: PartitionId,
        signature: String,
    },

    /// The source already exists
    #[error("Export source already exists: partition {partition} of {signature}")]
    SourceExists {
        partition: PartitionId,
        signature: String,
    },

    /// Source or registry is shutting down
    #[error("Export source shutting down")]
    ShuttingDown,

    /// Buffer or tracker error
    #[error("Core error: {0}")]
    Core(#[from] spillway_core::Error),

    /// Coordination or wire error
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Sink delivery error
    #[error("Sink error: {0}")]
    Sink(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExportError {
    pub fn poll_in_progress(partition: PartitionId, signature: impl Into<String>) -> Self {
        Self::PollInProgress {
            partition,
            signature: signature.into(),
        }
    }

    pub fn unknown_source(partition: PartitionId, signature: impl Into<String>) -> Self {
        Self::UnknownSource {
            partition,
            signature: signature.into(),
        }
    }

    /// Create a new config error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a new sink error
    pub fn sink(msg: impl Into<String>) -> Self {
        Self::Sink(msg.into())
    }

    /// Check if this error is retriable.
    ///
    /// Returns true for transient errors that may succeed on retry.
    pub fn is_retriable(&self) -> bool {
        match self {
            Self::PollInProgress { .. } => true,
            Self::Sink(_) => true,
            Self::Cluster(e) => e.is_retriable(),
            Self::Io(e) => {
                use std::io::ErrorKind;
                matches!(
                    e.kind(),
                    ErrorKind::ConnectionReset
                        | ErrorKind::ConnectionAborted
                        | ErrorKind::TimedOut
                        | ErrorKind::Interrupted
                )
            }

            Self::UnknownSource { .. }
            | Self::SourceExists { .. }
            | Self::ShuttingDown
            | Self::Core(_)
            | Self::Config(_) => false,
        }
    }

    /// Get the error category for metrics and alerting.
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::PollInProgress { .. } => ErrorCategory::Usage,
            Self::UnknownSource { .. } => ErrorCategory::Usage,
            Self::SourceExists { .. } => ErrorCategory::Usage,
            Self::ShuttingDown => ErrorCategory::Lifecycle,
            Self::Core(spillway_core::Error::ShuttingDown) => ErrorCategory::Lifecycle,
            Self::Core(_) => ErrorCategory::Storage,
            Self::Io(_) => ErrorCategory::Storage,
            Self::Cluster(_) => ErrorCategory::Coordination,
            Self::Config(_) => ErrorCategory::Configuration,
            Self::Sink(_) => ErrorCategory::Sink,
        }
    }

    /// True when the source is going away rather than failing
    pub fn is_shutdown(&self) -> bool {
        self.category() == ErrorCategory::Lifecycle
    }
}

/// Result type for export operations
pub type Result<T> = std::result::Result<T, ExportError>;

//! Cluster error types

use crate::node::HostId;
use thiserror::Error;

/// Result type for cluster operations
pub type Result<T> = std::result::Result<T, ClusterError>;

/// Cluster errors
#[derive(Debug, Error)]
pub enum ClusterError {
    // ==================== Membership Errors ====================
    #[error("host {0} already joined group {1}")]
    AlreadyJoined(HostId, String),

    #[error("host {0} is not a member of group {1}")]
    NotMember(HostId, String),

    #[error("unknown replica: {0}")]
    UnknownReplica(HostId),

    // ==================== Coordination Errors ====================
    #[error("lock request already outstanding for host {0}")]
    LockRequestPending(HostId),

    #[error("host {0} does not hold the lock")]
    LockNotHeld(HostId),

    #[error("task {0} is not in progress")]
    UnknownTask(u64),

    // ==================== Protocol Errors ====================
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("unknown message type: {0}")]
    UnknownMessageType(u8),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("deserialization error: {0}")]
    Deserialization(String),

    // ==================== Internal Errors ====================
    #[error("core error: {0}")]
    Core(#[from] spillway_core::Error),
}

impl ClusterError {
    /// Check if this error is retriable
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            ClusterError::LockRequestPending(_)
                | ClusterError::UnknownReplica(_)
                | ClusterError::Deserialization(_)
        )
    }

    /// Check if this is a fatal error requiring shutdown
    pub fn is_fatal(&self) -> bool {
        match self {
            ClusterError::Core(e) => e.is_fatal(),
            _ => false,
        }
    }
}

// Conversion from postcard for serialization
impl From<postcard::Error> for ClusterError {
    fn from(e: postcard::Error) -> Self {
        ClusterError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retriable_errors() {
        assert!(ClusterError::LockRequestPending(1).is_retriable());
        assert!(ClusterError::Deserialization("short".into()).is_retriable());
        assert!(!ClusterError::LockNotHeld(1).is_retriable());
        assert!(!ClusterError::UnknownMessageType(9).is_retriable());
    }

    #[test]
    fn test_fatal_errors() {
        let err: ClusterError = spillway_core::Error::CorruptBlock("bad crc".into()).into();
        assert!(err.is_fatal());
        assert!(!ClusterError::UnknownTask(4).is_fatal());
    }
}

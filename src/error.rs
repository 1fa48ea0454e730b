//! Error types for cogmesh.
//!
//! All errors are strongly typed using thiserror. This enables pattern
//! matching on specific error conditions and provides clear error messages.

use thiserror::Error;

use crate::atom::Handle;
use crate::storage::StorageError;

/// Validation errors that occur while constructing atoms, truth values and
/// cluster identifiers.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Truth component {value} is out of range [0.0, 1.0]")]
    TruthOutOfRange {
        value: f32,
    },

    #[error("Invalid evidence count {value}: must be finite and non-negative")]
    InvalidCount {
        value: f32,
    },

    #[error("Invalid truth interval: lower ({lower}) must not exceed upper ({upper})")]
    InvalidInterval {
        lower: f32,
        upper: f32,
    },

    #[error("Atom type cannot be empty")]
    EmptyAtomType,

    #[error("Node name cannot be empty")]
    EmptyNodeName,

    #[error("Link outgoing set cannot be empty")]
    EmptyOutgoingSet,

    #[error("Invalid node id '{id}': {reason}")]
    InvalidNodeId {
        id: String,
        reason: String,
    },

    #[error("Invalid atom handle: {reason}")]
    InvalidHandle {
        reason: String,
    },

    #[error("Invalid cluster config: {reason}")]
    InvalidConfig {
        reason: String,
    },

    #[error("Malformed atom data: {reason}")]
    MalformedAtomData {
        reason: String,
    },
}

/// Errors raised by `AtomSpace` operations.
///
/// Referential-integrity refusals are not errors: `remove_atom` reports
/// them as `Ok(false)` so callers can treat a blocked delete as a normal
/// outcome.
#[derive(Debug, Error)]
pub enum SpaceError {
    #[error("Link child {handle} is not present in the space")]
    MissingChild {
        handle: Handle,
    },

    #[error("Atom not found: {handle}")]
    AtomNotFound {
        handle: Handle,
    },

    #[error("Space lock poisoned during {context}")]
    LockPoisoned {
        context: &'static str,
    },
}

/// Wire protocol errors for the framed-JSON cluster transport.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Frame of {size} bytes exceeds maximum of {max}")]
    FrameTooLarge {
        size: usize,
        max: usize,
    },

    #[error("Malformed message: {reason}")]
    Malformed {
        reason: String,
    },

    #[error("Unexpected message while {context}")]
    UnexpectedMessage {
        context: &'static str,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Cluster membership and synchronization errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("Join rejected by seed: cluster id mismatch (ours: {cluster_id})")]
    JoinRejected {
        cluster_id: String,
    },

    #[error("Cluster node is already running")]
    AlreadyRunning,

    #[error("Cluster node is not running")]
    NotRunning,

    #[error("Peer {node} unreachable: {reason}")]
    PeerUnreachable {
        node: String,
        reason: String,
    },

    #[error("Timed out dialing {addr}")]
    DialTimeout {
        addr: String,
    },
}

/// Top-level error type for cogmesh.
///
/// This enum encompasses all possible errors that can occur when using
/// the store or the cluster layer.
#[derive(Debug, Error)]
pub enum MeshError {
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),

    #[error("Space error: {0}")]
    Space(#[from] SpaceError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl MeshError {
    /// Creates an internal error.
    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Returns true if this is a validation error.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(self, Self::Validation(_))
    }

    /// Returns true if this is a space error.
    #[must_use]
    pub const fn is_space(&self) -> bool {
        matches!(self, Self::Space(_))
    }

    /// Returns true if this is a protocol error.
    #[must_use]
    pub const fn is_protocol(&self) -> bool {
        matches!(self, Self::Protocol(_))
    }

    /// Returns true if this is a cluster error.
    #[must_use]
    pub const fn is_cluster(&self) -> bool {
        matches!(self, Self::Cluster(_))
    }

    /// Returns true if this error is retryable.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Validation(_) => false, // Validation errors won't change on retry
            Self::Space(_) => false,
            Self::Protocol(e) => matches!(e, ProtocolError::Io(_)),
            Self::Cluster(e) => matches!(
                e,
                ClusterError::PeerUnreachable { .. } | ClusterError::DialTimeout { .. }
            ),
            Self::Storage(e) => matches!(e, StorageError::ConnectionError { .. }),
            Self::Internal { .. } => false,
        }
    }
}

/// Result type alias for cogmesh operations.
pub type MeshResult<T> = Result<T, MeshError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_truth_range() {
        let err = ValidationError::TruthOutOfRange { value: 1.5 };
        let msg = format!("{err}");
        assert!(msg.contains("1.5"));
        assert!(msg.contains("out of range"));
    }

    #[test]
    fn test_validation_error_interval() {
        let err = ValidationError::InvalidInterval {
            lower: 0.8,
            upper: 0.2,
        };
        let msg = format!("{err}");
        assert!(msg.contains("0.8"));
        assert!(msg.contains("0.2"));
    }

    #[test]
    fn test_space_error_missing_child() {
        let handle = Handle::zero();
        let err = SpaceError::MissingChild { handle };
        let msg = format!("{err}");
        assert!(msg.contains("not present"));
    }

    #[test]
    fn test_protocol_error_frame_too_large() {
        let err = ProtocolError::FrameTooLarge {
            size: 10_000_000,
            max: 4_194_304,
        };
        let msg = format!("{err}");
        assert!(msg.contains("10000000"));
        assert!(msg.contains("4194304"));
    }

    #[test]
    fn test_cluster_error_join_rejected() {
        let err = ClusterError::JoinRejected {
            cluster_id: "mesh-a".to_string(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("mesh-a"));
        assert!(msg.contains("rejected"));
    }

    #[test]
    fn test_mesh_error_from_validation() {
        let validation_err = ValidationError::EmptyNodeName;
        let mesh_err: MeshError = validation_err.into();
        assert!(mesh_err.is_validation());
        assert!(!mesh_err.is_retryable());
    }

    #[test]
    fn test_mesh_error_from_cluster() {
        let cluster_err = ClusterError::DialTimeout {
            addr: "127.0.0.1:7500".to_string(),
        };
        let mesh_err: MeshError = cluster_err.into();
        assert!(mesh_err.is_cluster());
        assert!(mesh_err.is_retryable());
    }

    #[test]
    fn test_mesh_error_from_protocol_io() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let mesh_err: MeshError = ProtocolError::Io(io).into();
        assert!(mesh_err.is_protocol());
        assert!(mesh_err.is_retryable());
    }

    #[test]
    fn test_mesh_error_internal() {
        let err = MeshError::internal("unexpected state");
        assert!(!err.is_retryable());
        let msg = format!("{err}");
        assert!(msg.contains("unexpected state"));
    }

    #[test]
    fn test_mesh_error_malformed_not_retryable() {
        let err: MeshError = ProtocolError::Malformed {
            reason: "bad tag".to_string(),
        }
        .into();
        assert!(err.is_protocol());
        assert!(!err.is_retryable());
    }
}

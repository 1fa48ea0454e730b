//! Cluster member identity and liveness records.
//!
//! Node IDs must be stable across restarts of the same logical node so
//! vector clock entries keep their meaning; they are validated on entry
//! because they travel in every wire message and every clock.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Maximum length of a node ID in bytes.
pub const NODE_ID_MAX_LEN: usize = 128;

/// Unique identifier for a cluster node.
///
/// Alphanumeric plus `-`, `_` and `.`; non-empty and at most
/// [`NODE_ID_MAX_LEN`] bytes.
///
/// # Examples
///
/// ```
/// use cogmesh::NodeId;
///
/// let id = NodeId::new("agent-7").unwrap();
/// assert_eq!(id.as_str(), "agent-7");
/// assert!(NodeId::new("agent 7").is_err());
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Creates a node ID with validation.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidNodeId` if the id is empty, too
    /// long, or contains characters outside the allowed set.
    pub fn new(id: impl Into<String>) -> Result<Self, ValidationError> {
        let id = id.into();

        if id.is_empty() {
            return Err(ValidationError::InvalidNodeId {
                id,
                reason: "node id cannot be empty".to_string(),
            });
        }

        if id.len() > NODE_ID_MAX_LEN {
            return Err(ValidationError::InvalidNodeId {
                reason: format!("length {} exceeds limit {}", id.len(), NODE_ID_MAX_LEN),
                id,
            });
        }

        let valid = id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid {
            return Err(ValidationError::InvalidNodeId {
                id,
                reason: "node id contains invalid characters".to_string(),
            });
        }

        Ok(Self(id))
    }

    /// Generates a fresh node ID with a random suffix.
    #[must_use]
    pub fn generate() -> Self {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        Self(format!("node-{}", &suffix[..12]))
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for NodeId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a cluster node.
///
/// `start` moves a node from `Initializing` to `Active`; `stop` moves it
/// to `Offline`. `Degraded` and `Failed` are reported states only, never
/// entered automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    /// Constructed but not yet serving.
    Initializing,
    /// Serving and heartbeating.
    Active,
    /// Serving with reduced capacity.
    Degraded,
    /// Known broken.
    Failed,
    /// Cleanly shut down.
    Offline,
}

impl NodeStatus {
    /// Returns true if a node in this state participates in sync.
    #[must_use]
    pub const fn can_sync(&self) -> bool {
        matches!(self, Self::Active | Self::Degraded)
    }

    /// Returns true for states a node never recovers from on its own.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Offline)
    }
}

impl fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Active => write!(f, "active"),
            Self::Degraded => write!(f, "degraded"),
            Self::Failed => write!(f, "failed"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// What one node knows about another.
///
/// Refreshed by heartbeats; evicted when [`MemberInfo::is_stale`] reports
/// the heartbeat has lapsed past the configured staleness timeout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberInfo {
    /// Unique node identifier.
    pub id: NodeId,
    /// Host the node's listener is reachable on.
    pub host: String,
    /// Port the node's listener is reachable on.
    pub port: u16,
    /// Last reported status.
    pub status: NodeStatus,
    /// When the last heartbeat (or join) from this node arrived.
    pub last_heartbeat: DateTime<Utc>,
    /// Atom count the node last reported.
    pub atomspace_size: u64,
    /// Load the node last reported, 0.0 to 1.0.
    pub load_factor: f32,
}

impl MemberInfo {
    /// Creates a member record as of now, in the `Active` state.
    #[must_use]
    pub fn new(id: NodeId, host: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            host: host.into(),
            port,
            status: NodeStatus::Active,
            last_heartbeat: Utc::now(),
            atomspace_size: 0,
            load_factor: 0.0,
        }
    }

    /// Dialable `host:port` address.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Applies a heartbeat: refreshes status, load and the liveness
    /// timestamp. Stale timestamps (behind the current record) refresh
    /// nothing.
    pub fn touch(
        &mut self,
        status: NodeStatus,
        atomspace_size: u64,
        load_factor: f32,
        timestamp: DateTime<Utc>,
    ) {
        if timestamp >= self.last_heartbeat {
            self.status = status;
            self.atomspace_size = atomspace_size;
            self.load_factor = load_factor;
            self.last_heartbeat = timestamp;
        }
    }

    /// Returns true if the last heartbeat is older than `timeout`.
    #[must_use]
    pub fn is_stale(&self, now: DateTime<Utc>, timeout: std::time::Duration) -> bool {
        match chrono::Duration::from_std(timeout) {
            Ok(limit) => now.signed_duration_since(self.last_heartbeat) > limit,
            // Timeout too large to represent: nothing ever goes stale.
            Err(_) => false,
        }
    }
}

//! Cluster node configuration.

use std::time::Duration;

use crate::cluster::member::NodeId;
use crate::cluster::resolver::ConflictStrategy;
use crate::error::ValidationError;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 7500;

/// Default interval between heartbeat broadcasts.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Default silence after which a member is evicted.
pub const DEFAULT_STALENESS_TIMEOUT: Duration = Duration::from_secs(60);

/// Default interval between pending-queue drains.
pub const DEFAULT_SYNC_INTERVAL: Duration = Duration::from_secs(5);

/// Default timeout for dialing a peer.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of delivery attempts per (operation, peer) pair.
pub const DEFAULT_SYNC_RETRY_LIMIT: u32 = 3;

/// Default window for collecting conflict votes.
pub const DEFAULT_VOTE_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for a [`ClusterNode`](crate::cluster::ClusterNode).
///
/// # Examples
///
/// ```
/// use cogmesh::cluster::ClusterConfig;
///
/// let config = ClusterConfig::new("knowledge-mesh")
///     .with_port(7501)
///     .with_sync_retry_limit(5);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// Cluster this node belongs to; join requests across clusters are
    /// rejected.
    pub cluster_id: String,
    /// This node's identity.
    pub node_id: NodeId,
    /// Host to bind and advertise.
    pub host: String,
    /// Port to bind and advertise. Zero asks the OS for an ephemeral
    /// port; the bound port is advertised once known.
    pub port: u16,
    /// Interval between heartbeat broadcasts.
    pub heartbeat_interval: Duration,
    /// Silence after which a member is evicted.
    pub staleness_timeout: Duration,
    /// Interval between pending-queue drains.
    pub sync_interval: Duration,
    /// Timeout for dialing a peer.
    pub dial_timeout: Duration,
    /// Delivery attempts per (operation, peer) pair before dropping.
    pub sync_retry_limit: u32,
    /// Window for collecting conflict votes.
    pub vote_timeout: Duration,
    /// How concurrent remote mutations are resolved.
    pub strategy: ConflictStrategy,
}

impl ClusterConfig {
    /// Creates a config for the named cluster with default timings and a
    /// generated node id.
    #[must_use]
    pub fn new(cluster_id: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            node_id: NodeId::generate(),
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            staleness_timeout: DEFAULT_STALENESS_TIMEOUT,
            sync_interval: DEFAULT_SYNC_INTERVAL,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            sync_retry_limit: DEFAULT_SYNC_RETRY_LIMIT,
            vote_timeout: DEFAULT_VOTE_TIMEOUT,
            strategy: ConflictStrategy::MergeTruthValues,
        }
    }

    /// Sets the node id.
    #[must_use]
    pub fn with_node_id(mut self, node_id: NodeId) -> Self {
        self.node_id = node_id;
        self
    }

    /// Sets the bind/advertise host.
    #[must_use]
    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    /// Sets the bind/advertise port.
    #[must_use]
    pub const fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    /// Sets the heartbeat interval.
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the staleness timeout.
    #[must_use]
    pub const fn with_staleness_timeout(mut self, timeout: Duration) -> Self {
        self.staleness_timeout = timeout;
        self
    }

    /// Sets the sync drain interval.
    #[must_use]
    pub const fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval = interval;
        self
    }

    /// Sets the dial timeout.
    #[must_use]
    pub const fn with_dial_timeout(mut self, timeout: Duration) -> Self {
        self.dial_timeout = timeout;
        self
    }

    /// Sets the per-(operation, peer) delivery attempt limit.
    #[must_use]
    pub const fn with_sync_retry_limit(mut self, limit: u32) -> Self {
        self.sync_retry_limit = limit;
        self
    }

    /// Sets the vote collection window.
    #[must_use]
    pub const fn with_vote_timeout(mut self, timeout: Duration) -> Self {
        self.vote_timeout = timeout;
        self
    }

    /// Sets the conflict resolution strategy.
    #[must_use]
    pub const fn with_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Checks the configuration for values that cannot work.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidConfig` naming the first problem
    /// found.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.cluster_id.trim().is_empty() {
            return Err(ValidationError::InvalidConfig {
                reason: "cluster_id cannot be empty".to_string(),
            });
        }
        if self.host.trim().is_empty() {
            return Err(ValidationError::InvalidConfig {
                reason: "host cannot be empty".to_string(),
            });
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ValidationError::InvalidConfig {
                reason: "heartbeat_interval must be positive".to_string(),
            });
        }
        if self.sync_interval.is_zero() {
            return Err(ValidationError::InvalidConfig {
                reason: "sync_interval must be positive".to_string(),
            });
        }
        if self.staleness_timeout < self.heartbeat_interval {
            return Err(ValidationError::InvalidConfig {
                reason: "staleness_timeout must be at least heartbeat_interval".to_string(),
            });
        }
        Ok(())
    }

    /// Config with short timings for tests: ephemeral port, fast
    /// heartbeats, fast eviction.
    #[must_use]
    pub fn for_testing(cluster_id: impl Into<String>) -> Self {
        Self::new(cluster_id)
            .with_port(0)
            .with_heartbeat_interval(Duration::from_millis(100))
            .with_staleness_timeout(Duration::from_millis(400))
            .with_sync_interval(Duration::from_millis(50))
            .with_dial_timeout(Duration::from_secs(1))
            .with_vote_timeout(Duration::from_millis(500))
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self::new("cogmesh")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(ClusterConfig::default().validate().is_ok());
    }

    #[test]
    fn test_for_testing_is_valid() {
        let config = ClusterConfig::for_testing("test-mesh");
        assert!(config.validate().is_ok());
        assert_eq!(config.port, 0);
        assert!(config.heartbeat_interval < Duration::from_secs(1));
    }

    #[test]
    fn test_builders_chain() {
        let node_id = NodeId::new("n1").unwrap();
        let config = ClusterConfig::new("mesh")
            .with_node_id(node_id.clone())
            .with_host("0.0.0.0")
            .with_port(9000)
            .with_heartbeat_interval(Duration::from_secs(10))
            .with_staleness_timeout(Duration::from_secs(20));

        assert_eq!(config.node_id, node_id);
        assert_eq!(config.host, "0.0.0.0");
        assert_eq!(config.port, 9000);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_cluster_id() {
        let config = ClusterConfig::new("  ");
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_heartbeat() {
        let config = ClusterConfig::new("mesh").with_heartbeat_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_eviction_faster_than_heartbeat() {
        let config = ClusterConfig::new("mesh")
            .with_heartbeat_interval(Duration::from_secs(30))
            .with_staleness_timeout(Duration::from_secs(10));
        assert!(config.validate().is_err());
    }
}

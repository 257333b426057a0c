//! Configuration for a shardkv node
//!
//! Combines settings for the store, the transport and snapshot persistence.

use std::path::PathBuf;
use std::time::Duration;

use crate::store::DEFAULT_SHARD_COUNT;

/// Complete node configuration
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Address the listener binds to
    pub listen_addr: String,

    /// Address peers should use to reach this node. Defaults to the bound
    /// address when unset.
    pub advertise_addr: Option<String>,

    /// Peers known at startup
    pub static_peers: Vec<String>,

    pub store: StoreConfig,
    pub transport: TransportConfig,
    pub persistence: PersistenceConfig,
}

/// Store configuration
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Number of independently locked shards
    pub shard_count: usize,
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// How long a sent request stays in the pending table
    pub request_timeout: Duration,

    /// Caller-side bound for synchronous calls
    pub call_timeout: Duration,

    /// Bound on a WebSocket handshake, on both the dialing and accepting side
    pub connect_timeout: Duration,

    /// Interval between server keepalive pings
    pub keepalive_interval: Duration,

    /// Capacity of each connection's outgoing queue
    pub send_queue: usize,
}

/// Snapshot persistence configuration
#[derive(Debug, Clone)]
pub struct PersistenceConfig {
    /// Snapshot file. `None` disables persistence.
    pub path: Option<PathBuf>,

    /// Interval between periodic saves
    pub interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            advertise_addr: None,
            static_peers: Vec::new(),
            store: StoreConfig::default(),
            transport: TransportConfig::default(),
            persistence: PersistenceConfig::default(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            shard_count: DEFAULT_SHARD_COUNT,
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(60),
            call_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(45),
            keepalive_interval: Duration::from_secs(54),
            send_queue: 256,
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            path: None,
            interval: Duration::from_secs(2),
        }
    }
}

impl NodeConfig {
    /// Create config listening on `listen_addr`
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            ..Default::default()
        }
    }

    /// Set the address announced to peers
    pub fn with_advertise(mut self, addr: impl Into<String>) -> Self {
        self.advertise_addr = Some(addr.into());
        self
    }

    /// Add a peer known at startup
    pub fn with_peer(mut self, addr: impl Into<String>) -> Self {
        self.static_peers.push(addr.into());
        self
    }

    /// Set shard count
    pub fn with_shards(mut self, count: usize) -> Self {
        self.store.shard_count = count;
        self
    }

    /// Set the transport request timeout
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.transport.request_timeout = timeout;
        self
    }

    /// Set the caller-side call timeout
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.transport.call_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.transport.connect_timeout = timeout;
        self
    }

    /// Enable snapshot persistence to `path`
    pub fn with_snapshot(mut self, path: impl Into<PathBuf>) -> Self {
        self.persistence.path = Some(path.into());
        self
    }

    /// Set snapshot interval
    pub fn with_snapshot_interval(mut self, interval: Duration) -> Self {
        self.persistence.interval = interval;
        self
    }
}

/// Default snapshot file name for a node listening on `listen_addr`.
///
/// The port is appended so several nodes can share one data directory.
pub fn snapshot_file_name(listen_addr: &str) -> String {
    let port: String = listen_addr
        .chars()
        .rev()
        .take_while(|c| c.is_ascii_digit())
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect();

    if port.is_empty() {
        "storage.json".to_string()
    } else {
        format!("storage.{}.json", port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new("127.0.0.1:9000")
            .with_advertise("10.0.0.5:9000")
            .with_peer("10.0.0.6:9000")
            .with_shards(8)
            .with_call_timeout(Duration::from_millis(500))
            .with_connect_timeout(Duration::from_secs(2))
            .with_snapshot("/tmp/kv.json");

        assert_eq!(config.listen_addr, "127.0.0.1:9000");
        assert_eq!(config.advertise_addr.as_deref(), Some("10.0.0.5:9000"));
        assert_eq!(config.static_peers, vec!["10.0.0.6:9000"]);
        assert_eq!(config.store.shard_count, 8);
        assert_eq!(config.transport.call_timeout, Duration::from_millis(500));
        assert_eq!(config.transport.request_timeout, Duration::from_secs(60));
        assert_eq!(config.transport.connect_timeout, Duration::from_secs(2));
        assert_eq!(config.persistence.path, Some(PathBuf::from("/tmp/kv.json")));
    }

    #[test]
    fn test_snapshot_file_name() {
        assert_eq!(snapshot_file_name("127.0.0.1:8080"), "storage.8080.json");
        assert_eq!(snapshot_file_name(":9001"), "storage.9001.json");
        assert_eq!(snapshot_file_name("localhost"), "storage.json");
    }
}

//! Outbound half of replication
//!
//! Keeps the set of known peers, announces this node to newly learned peers
//! and fans every local change out to all of them.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tokio::runtime::Handle;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::{ClientError, RpcClient};
use crate::config::TransportConfig;
use crate::router::HandlerError;
use crate::store::Store;
use crate::types::{Request, REPLICATION_PATH};

/// A known peer and its lazily dialed connection
pub struct PeerNode {
    address: String,
    /// `None` until the first send to this peer
    connection: Mutex<Option<Arc<RpcClient>>>,
}

impl PeerNode {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            connection: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether a live connection is cached
    pub async fn is_connected(&self) -> bool {
        matches!(self.connection.lock().await.as_ref(), Some(c) if !c.is_closed())
    }

    /// Cached connection, dialing a new one when none is usable
    async fn connection(&self, config: &TransportConfig) -> Result<Arc<RpcClient>, ClientError> {
        let mut slot = self.connection.lock().await;
        if let Some(conn) = slot.as_ref() {
            if !conn.is_closed() {
                return Ok(conn.clone());
            }
            debug!("Replication: connection to {} lost, redialing", self.address);
        }

        let conn = Arc::new(RpcClient::connect(&self.address, REPLICATION_PATH, config).await?);
        *slot = Some(conn.clone());
        Ok(conn)
    }
}

/// Peer set and change fan-out
pub struct ReplicationClient {
    self_address: String,
    peers: RwLock<HashMap<String, Arc<PeerNode>>>,
    config: TransportConfig,
    /// Runtime captured by `attach`, used when a hook fires on a plain thread
    runtime: OnceLock<Handle>,
}

impl ReplicationClient {
    pub fn new(self_address: impl Into<String>, config: TransportConfig) -> Self {
        Self {
            self_address: self_address.into(),
            peers: RwLock::new(HashMap::new()),
            config,
            runtime: OnceLock::new(),
        }
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    /// Addresses of all known peers, sorted
    pub fn peers(&self) -> Vec<String> {
        let mut addrs: Vec<String> = self.peers.read().keys().cloned().collect();
        addrs.sort();
        addrs
    }

    pub fn peer(&self, address: &str) -> Option<Arc<PeerNode>> {
        self.peers.read().get(address).cloned()
    }

    /// Add `address` unless it is this node or already known.
    /// Returns whether it was new.
    fn add_peer(&self, address: &str) -> bool {
        if address.is_empty() || address == self.self_address {
            return false;
        }

        let mut peers = self.peers.write();
        if peers.contains_key(address) {
            return false;
        }
        peers.insert(address.to_string(), Arc::new(PeerNode::new(address)));
        true
    }

    /// Merge a discovery broadcast into the peer set and announce this node
    /// to every peer learned from it. Returns the newly learned addresses.
    pub fn handle_new_nodes(&self, addresses: &[String]) -> Vec<String> {
        let learned: Vec<String> = addresses
            .iter()
            .filter(|addr| self.add_peer(addr))
            .cloned()
            .collect();

        if learned.is_empty() {
            debug!("Replication: no new nodes in {:?}", addresses);
            return learned;
        }

        info!("Replication: learned nodes {:?}", learned);

        let announce = Request::register(self.self_address.clone());
        for addr in &learned {
            if let Some(peer) = self.peer(addr) {
                self.spawn_sync(peer, announce.clone());
            }
        }

        learned
    }

    /// `NODES` handler: `option_1` holds a JSON array of addresses
    pub fn handle_nodes_request(&self, request: &Request) -> Result<String, HandlerError> {
        let addresses: Vec<String> = serde_json::from_str(&request.option_1)?;
        self.handle_new_nodes(&addresses);
        Ok(String::new())
    }

    /// A peer announced itself
    pub fn handle_register(&self, address: &str) -> bool {
        let added = self.add_peer(address);
        if added {
            info!("Replication: node {} registered", address);
        }
        added
    }

    /// Store hook for accepted local sets
    pub fn handle_updated(&self, key: &str, value: &str, version: i64) {
        debug!("Replication: sync update {}={} (v{})", key, value, version);
        self.fan_out(Request::updated(key, value, version));
    }

    /// Store hook for accepted local removals
    pub fn handle_removed(&self, key: &str, version: i64) {
        debug!("Replication: sync remove {} (v{})", key, version);
        self.fan_out(Request::removed(key, version));
    }

    /// Send `request` to every known peer, one task per peer
    fn fan_out(&self, request: Request) {
        let peers: Vec<Arc<PeerNode>> = self.peers.read().values().cloned().collect();
        for peer in peers {
            self.spawn_sync(peer, request.clone());
        }
    }

    /// Start delivering `request` to `peer` in the background
    fn spawn_sync(&self, peer: Arc<PeerNode>, request: Request) {
        let runtime = Handle::try_current()
            .ok()
            .or_else(|| self.runtime.get().cloned());
        match runtime {
            Some(runtime) => {
                runtime.spawn(sync(peer, request, self.config.clone()));
            }
            None => warn!(
                "Replication: no runtime to send {} to {}, dropped",
                request.action,
                peer.address()
            ),
        }
    }

    /// Install the fan-out hooks on `store`.
    ///
    /// When called inside a Tokio runtime, that runtime also carries changes
    /// made from threads outside it.
    pub fn attach(self: &Arc<Self>, store: &Store) {
        if let Ok(runtime) = Handle::try_current() {
            let _ = self.runtime.set(runtime);
        }

        let client = self.clone();
        store.add_set_handler(Arc::new(move |key: &str, value: &str, version: i64| {
            client.handle_updated(key, value, version)
        }));

        let client = self.clone();
        store.add_remove_handler(Arc::new(move |key: &str, version: i64| {
            client.handle_removed(key, version)
        }));
    }
}

/// Deliver one request to one peer. Failures are logged and dropped.
async fn sync(peer: Arc<PeerNode>, request: Request, config: TransportConfig) {
    let conn = match peer.connection(&config).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!("Replication: cannot reach {}: {}", peer.address(), e);
            return;
        }
    };

    match conn.send_sync(&request).await {
        Ok(resp) if resp.success => {
            debug!("Replication: {} {} sent to {}", request.action, request.option_1, peer.address());
        }
        Ok(resp) => {
            warn!(
                "Replication: {} rejected {}: {}",
                peer.address(),
                request.action,
                resp.error
            );
        }
        Err(e) => {
            warn!("Replication: {} to {} failed: {}", request.action, peer.address(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::ReplicationServer;
    use crate::transport::Server;
    use std::time::{Duration, Instant};

    async fn wait_for<F: Fn() -> bool>(check: F) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if check() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        check()
    }

    /// A store behind a bound replication endpoint
    async fn replica() -> (String, Arc<Store>, Arc<ReplicationClient>) {
        let server = Server::bind("127.0.0.1:0", TransportConfig::default())
            .await
            .unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let store = Arc::new(Store::default());
        let client = Arc::new(ReplicationClient::new(addr.clone(), TransportConfig::default()));
        let server = ReplicationServer::new(store.clone(), client.clone()).bind(server);
        tokio::spawn(server.run());

        (addr, store, client)
    }

    #[test]
    fn test_register_ignores_self_and_duplicates() {
        let client = ReplicationClient::new("self:1", TransportConfig::default());
        assert!(!client.handle_register("self:1"));
        assert!(!client.handle_register(""));
        assert!(client.handle_register("peer:2"));
        assert!(!client.handle_register("peer:2"));
        assert_eq!(client.peers(), vec!["peer:2"]);
    }

    #[test]
    fn test_nodes_request_rejects_bad_json() {
        let client = ReplicationClient::new("self:1", TransportConfig::default());
        let req = Request::new("NODES").with_option_1("not a list");
        assert!(matches!(
            client.handle_nodes_request(&req),
            Err(HandlerError::Json(_))
        ));
        assert!(client.peers().is_empty());
    }

    #[tokio::test]
    async fn test_new_nodes_merges_minus_self() {
        let client = ReplicationClient::new("self:1", TransportConfig::default());
        let learned = client.handle_new_nodes(&[
            "self:1".to_string(),
            "127.0.0.1:1".to_string(),
            "127.0.0.1:2".to_string(),
        ]);
        assert_eq!(learned, vec!["127.0.0.1:1", "127.0.0.1:2"]);

        let learned = client.handle_new_nodes(&["127.0.0.1:2".to_string()]);
        assert!(learned.is_empty());
        assert_eq!(client.peers(), vec!["127.0.0.1:1", "127.0.0.1:2"]);

        let peer = client.peer("127.0.0.1:1").unwrap();
        assert_eq!(peer.address(), "127.0.0.1:1");
    }

    #[tokio::test]
    async fn test_unreachable_peer_does_not_block_writes() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead = listener.local_addr().unwrap().to_string();
        drop(listener);

        let store = Store::default();
        let client = Arc::new(ReplicationClient::new("self:1", TransportConfig::default()));
        client.attach(&store);
        client.handle_register(&dead);

        store.set("k", "v");
        assert!(store.remove("k"));

        tokio::time::sleep(Duration::from_millis(100)).await;
        let peer = client.peer(&dead).unwrap();
        assert!(!peer.is_connected().await);
    }

    #[tokio::test]
    async fn test_local_changes_reach_peer() {
        let (b_addr, b_store, _) = replica().await;

        let a_store = Store::default();
        let a_client = Arc::new(ReplicationClient::new("127.0.0.1:0", TransportConfig::default()));
        a_client.attach(&a_store);
        a_client.handle_register(&b_addr);

        a_store.set("k", "v1");
        a_store.set("k", "v2");
        assert!(
            wait_for(|| b_store.get_record("k").map(|r| r.version) == Some(2)).await,
            "update never arrived"
        );
        assert_eq!(b_store.get("k"), Some("v2".to_string()));

        a_store.remove("k");
        assert!(wait_for(|| b_store.get("k").is_none()).await, "removal never arrived");

        // One cached connection serves every event
        assert!(a_client.peer(&b_addr).unwrap().is_connected().await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_changes_from_plain_thread_are_replicated() {
        let (b_addr, b_store, _) = replica().await;

        let a_store = Arc::new(Store::default());
        let a_client = Arc::new(ReplicationClient::new("127.0.0.1:0", TransportConfig::default()));
        a_client.attach(&a_store);
        a_client.handle_register(&b_addr);

        let writer = a_store.clone();
        std::thread::spawn(move || writer.set("k", "from-thread"))
            .join()
            .unwrap();

        assert!(
            wait_for(|| b_store.get("k") == Some("from-thread".to_string())).await,
            "update never arrived"
        );
    }

    #[tokio::test]
    async fn test_silent_peer_does_not_hold_connection_slot() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let silent = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            // Accept TCP connections but never complete a handshake
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let config = TransportConfig {
            connect_timeout: Duration::from_millis(100),
            call_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let store = Store::default();
        let client = Arc::new(ReplicationClient::new("self:1", config));
        client.attach(&store);
        client.handle_register(&silent);

        for i in 0..5 {
            store.set("k", &i.to_string());
        }

        tokio::time::sleep(Duration::from_millis(800)).await;
        let peer = client.peer(&silent).unwrap();
        let connected = tokio::time::timeout(Duration::from_millis(500), peer.is_connected())
            .await
            .expect("connection slot still held by a dial");
        assert!(!connected);
    }

    /// Serve `/sync` one connection at a time on a task the test can abort
    fn serve_sync(
        listener: tokio::net::TcpListener,
        router: Arc<crate::router::Router>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                    crate::transport::serve_connection(
                        ws,
                        router.clone(),
                        TransportConfig::default(),
                        peer.to_string(),
                    )
                    .await;
                }
            }
        })
    }

    #[tokio::test]
    async fn test_lost_connection_is_redialed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let b_addr = listener.local_addr().unwrap().to_string();
        let b_store = Arc::new(Store::default());
        let b_client = Arc::new(ReplicationClient::new(b_addr.clone(), TransportConfig::default()));
        let router = Arc::new(ReplicationServer::new(b_store.clone(), b_client).router());
        let b_task = serve_sync(listener, router.clone());

        let a_store = Store::default();
        let a_client = Arc::new(ReplicationClient::new("127.0.0.1:0", TransportConfig::default()));
        a_client.attach(&a_store);
        a_client.handle_register(&b_addr);

        a_store.set("k", "v1");
        assert!(wait_for(|| b_store.get("k") == Some("v1".to_string())).await);
        let peer = a_client.peer(&b_addr).unwrap();
        assert!(peer.is_connected().await);

        // Take B down, connection included, then bring it back on the same port
        b_task.abort();
        let _ = b_task.await;
        let deadline = Instant::now() + Duration::from_secs(5);
        while peer.is_connected().await && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert!(!peer.is_connected().await, "dead connection still reported live");

        let listener = tokio::net::TcpListener::bind(&b_addr).await.unwrap();
        let _b_task = serve_sync(listener, router);

        a_store.set("k", "v2");
        assert!(
            wait_for(|| b_store.get("k") == Some("v2".to_string())).await,
            "write after restart never arrived"
        );
        assert!(peer.is_connected().await);
    }

    #[tokio::test]
    async fn test_discovery_registers_back() {
        let (a_addr, _, a_client) = replica().await;
        let (b_addr, _, b_client) = replica().await;

        a_client.handle_new_nodes(&[a_addr.clone(), b_addr.clone()]);
        assert_eq!(a_client.peers(), vec![b_addr.clone()]);

        assert!(
            wait_for(|| b_client.peers() == vec![a_addr.clone()]).await,
            "b never learned about a"
        );
    }
}

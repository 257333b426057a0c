//! Node assembly
//!
//! Wires store, routers, replication and persistence together behind one
//! listener:
//!
//! ```text
//!   clients ──ws──►  client router ──► Store ──hooks──► ReplicationClient
//!                                        ▲                    │
//!   peers ──sync──► replication router ──┘                    ▼
//!                                                     peers' /sync
//! ```

use std::sync::Arc;

use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::NodeConfig;
use crate::handlers::{client_router, with_discovery};
use crate::persistence::{PersistenceError, Persister};
use crate::replication::{ReplicationClient, ReplicationServer};
use crate::store::Store;
use crate::transport::{Server, TransportError};
use crate::types::CLIENT_PATH;

/// Startup failures
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("persistence error: {0}")]
    Persistence(#[from] PersistenceError),
}

/// A running replica
pub struct Node {
    address: String,
    store: Arc<Store>,
    replication: Arc<ReplicationClient>,
    persister: Option<Arc<Persister>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Load the snapshot, bind the listener and start serving
    pub async fn start(config: NodeConfig) -> Result<Self, NodeError> {
        let store = Arc::new(Store::new(config.store.shard_count));
        store.add_set_handler(Arc::new(|key: &str, value: &str, version: i64| {
            debug!("Store: set {}={} (v{})", key, value, version)
        }));
        store.add_remove_handler(Arc::new(|key: &str, version: i64| {
            debug!("Store: remove {} (v{})", key, version)
        }));

        // Loaded before replication is attached so restored keys stay local
        let persister = config
            .persistence
            .path
            .as_ref()
            .map(|path| Arc::new(Persister::new(path)));
        if let Some(persister) = &persister {
            persister.load(|key, value| {
                store.set(key, value);
            })?;
        }

        let server = Server::bind(&config.listen_addr, config.transport.clone()).await?;
        let local_addr = server.local_addr()?;
        let address = config
            .advertise_addr
            .clone()
            .unwrap_or_else(|| local_addr.to_string());

        let replication = Arc::new(ReplicationClient::new(
            address.clone(),
            config.transport.clone(),
        ));
        let router = with_discovery(client_router(store.clone()), replication.clone());
        let server = ReplicationServer::new(store.clone(), replication.clone())
            .bind(server.route(CLIENT_PATH, Arc::new(router)));
        replication.attach(&store);

        let mut tasks = vec![tokio::spawn(server.run())];
        if let Some(persister) = &persister {
            tasks.push(persister.spawn_save_loop(store.clone(), config.persistence.interval));
        }

        if !config.static_peers.is_empty() {
            replication.handle_new_nodes(&config.static_peers);
        }

        info!(
            "Node: {} ready ({} keys, {} shards)",
            address,
            store.len(),
            store.shard_count()
        );

        Ok(Self {
            address,
            store,
            replication,
            persister,
            tasks,
        })
    }

    /// Address announced to peers
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn replication(&self) -> &Arc<ReplicationClient> {
        &self.replication
    }

    /// Stop accepting connections and write a final snapshot
    pub fn shutdown(self) -> Result<(), NodeError> {
        for task in &self.tasks {
            task.abort();
        }

        if let Some(persister) = &self.persister {
            persister.save(self.store.list())?;
            info!("Node: final snapshot written to {:?}", persister.path());
        }

        info!("Node: {} stopped", self.address);
        Ok(())
    }
}

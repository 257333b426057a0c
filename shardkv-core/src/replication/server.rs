//! Inbound half of replication
//!
//! Exposes `register`, `updated` and `removed` on the replication path. Writes
//! go through the store's merge primitives, so stale or duplicated events are
//! discarded silently.

use std::sync::Arc;

use tracing::debug;

use super::client::ReplicationClient;
use crate::router::Router;
use crate::store::Store;
use crate::transport::Server;
use crate::types::{action, REPLICATION_PATH};

pub struct ReplicationServer {
    store: Arc<Store>,
    client: Arc<ReplicationClient>,
}

impl ReplicationServer {
    pub fn new(store: Arc<Store>, client: Arc<ReplicationClient>) -> Self {
        Self { store, client }
    }

    /// Router for the replication actions
    pub fn router(&self) -> Router {
        let client = self.client.clone();
        let updated_store = self.store.clone();
        let removed_store = self.store.clone();

        Router::new()
            .route(action::REGISTER, move |r| {
                debug!("Replication: register request from {}", r.option_1);
                client.handle_register(&r.option_1);
                Ok(String::new())
            })
            .route(action::UPDATED, move |r| {
                let applied = updated_store.set_with_version(&r.option_1, &r.option_2, r.version);
                debug!(
                    "Replication: update {} (v{}) {}",
                    r.option_1,
                    r.version,
                    if applied { "applied" } else { "discarded" }
                );
                Ok(String::new())
            })
            .route(action::REMOVED, move |r| {
                let applied = removed_store.remove_with_version(&r.option_1, r.version);
                debug!(
                    "Replication: remove {} (v{}) {}",
                    r.option_1,
                    r.version,
                    if applied { "applied" } else { "discarded" }
                );
                Ok(String::new())
            })
    }

    /// Mount the replication router on `server`
    pub fn bind(&self, server: Server) -> Server {
        server.route(REPLICATION_PATH, Arc::new(self.router()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::types::Request;

    fn setup() -> (Arc<Store>, Arc<ReplicationClient>, Router) {
        let store = Arc::new(Store::default());
        let client = Arc::new(ReplicationClient::new("self:1", TransportConfig::default()));
        let router = ReplicationServer::new(store.clone(), client.clone()).router();
        (store, client, router)
    }

    #[test]
    fn test_updated_applies_last_writer_wins() {
        let (store, _, router) = setup();

        assert!(router.handle(&Request::updated("k", "a", 5)).success);
        assert!(router.handle(&Request::updated("k", "old", 3)).success);
        assert_eq!(store.get("k"), Some("a".to_string()));

        router.handle(&Request::updated("k", "b", 7));
        let record = store.get_record("k").unwrap();
        assert_eq!((record.value.as_str(), record.version), ("b", 7));
    }

    #[test]
    fn test_stale_removed_discarded() {
        let (store, _, router) = setup();
        router.handle(&Request::updated("k", "a", 5));

        // A removal that lost the race with a newer update
        assert!(router.handle(&Request::removed("k", 4)).success);
        assert_eq!(store.get("k"), Some("a".to_string()));

        router.handle(&Request::removed("k", 6));
        assert_eq!(store.get("k"), None);
    }

    #[test]
    fn test_register_adds_peer() {
        let (_, client, router) = setup();
        router.handle(&Request::register("peer:9"));
        router.handle(&Request::register("self:1"));
        assert_eq!(client.peers(), vec!["peer:9"]);
    }

    #[test]
    fn test_merge_writes_fire_no_hooks() {
        let (store, _, router) = setup();
        let fired = Arc::new(parking_lot::Mutex::new(0));
        let f = fired.clone();
        store.add_set_handler(Arc::new(move |_: &str, _: &str, _: i64| *f.lock() += 1));

        router.handle(&Request::updated("k", "a", 1));
        assert_eq!(*fired.lock(), 0);
    }
}

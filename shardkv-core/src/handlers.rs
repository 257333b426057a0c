//! Client-facing actions on the `ws` path

use std::sync::Arc;

use crate::replication::ReplicationClient;
use crate::router::{HandlerError, Router};
use crate::store::Store;
use crate::types::action;

/// Router serving `GET`, `SET`, `LIST`, `REMOVE` and `PING` against `store`
pub fn client_router(store: Arc<Store>) -> Router {
    let getter = store.clone();
    let setter = store.clone();
    let lister = store.clone();
    let remover = store;

    Router::new()
        .route(action::GET, move |r| {
            getter.get(&r.option_1).ok_or(HandlerError::ItemNotFound)
        })
        .route(action::SET, move |r| {
            setter.set(&r.option_1, &r.option_2);
            Ok(String::new())
        })
        .route(action::LIST, move |_| Ok(serde_json::to_string(&lister.list())?))
        .route(action::REMOVE, move |r| {
            if remover.remove(&r.option_1) {
                Ok(String::new())
            } else {
                Err(HandlerError::ItemNotFound)
            }
        })
        .route(action::PING, |_| Ok(String::new()))
}

/// Add the `NODES` discovery action to `router`
pub fn with_discovery(router: Router, replication: Arc<ReplicationClient>) -> Router {
    router.route(action::NODES, move |r| replication.handle_nodes_request(r))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::types::Request;
    use std::collections::HashMap;

    #[test]
    fn test_set_get_remove() {
        let store = Arc::new(Store::default());
        let router = client_router(store.clone());

        assert!(router.handle(&Request::set("k", "v")).success);
        assert_eq!(router.handle(&Request::get("k")).result, "v");

        assert!(router.handle(&Request::remove("k")).success);
        let resp = router.handle(&Request::get("k"));
        assert!(!resp.success);
        assert_eq!(resp.error, "item not exists");

        let resp = router.handle(&Request::remove("k"));
        assert!(!resp.success);
    }

    #[test]
    fn test_list_returns_json_object() {
        let store = Arc::new(Store::default());
        store.set("a", "1");
        store.set("b", "2");
        let router = client_router(store);

        let resp = router.handle(&Request::list());
        let all: HashMap<String, String> = serde_json::from_str(&resp.result).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all["b"], "2");
    }

    #[test]
    fn test_ping() {
        let router = client_router(Arc::new(Store::default()));
        assert_eq!(router.handle(&Request::ping()), crate::types::Response::ok(""));
    }

    #[tokio::test]
    async fn test_nodes_action() {
        let replication = Arc::new(ReplicationClient::new("self:1", TransportConfig::default()));
        let router = with_discovery(client_router(Arc::new(Store::default())), replication.clone());

        let req = Request::nodes(&["self:1".to_string(), "127.0.0.1:7".to_string()]).unwrap();
        assert!(router.handle(&req).success);
        assert_eq!(replication.peers(), vec!["127.0.0.1:7"]);

        let bad = Request::new(action::NODES).with_option_1("[1,");
        assert!(!router.handle(&bad).success);
    }
}

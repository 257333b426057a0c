//! Wire types shared by the transport, router and replication layers

use serde::{Deserialize, Serialize};

/// Action names understood by the routers.
///
/// Upper-case actions are client-facing, lower-case ones travel between nodes.
pub mod action {
    pub const GET: &str = "GET";
    pub const SET: &str = "SET";
    pub const LIST: &str = "LIST";
    pub const REMOVE: &str = "REMOVE";
    pub const PING: &str = "PING";
    /// Peer discovery broadcast, `option_1` carries a JSON array of addresses
    pub const NODES: &str = "NODES";

    pub const REGISTER: &str = "register";
    pub const UPDATED: &str = "updated";
    pub const REMOVED: &str = "removed";
}

/// Path of the client-facing WebSocket endpoint
pub const CLIENT_PATH: &str = "ws";

/// Path of the node-to-node replication endpoint
pub const REPLICATION_PATH: &str = "sync";

/// Transport-level wrapper correlating a response with its request.
///
/// The payload is an encoded [`Request`] or [`Response`] and is opaque to the
/// transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub request_id: i64,
    pub payload: String,
}

impl Envelope {
    pub fn new(request_id: i64, payload: impl Into<String>) -> Self {
        Self {
            request_id,
            payload: payload.into(),
        }
    }

    /// Serialize envelope to JSON text
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Deserialize envelope from JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Application request carried inside an [`Envelope`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    pub action: String,
    #[serde(default)]
    pub option_1: String,
    #[serde(default)]
    pub option_2: String,
    #[serde(default)]
    pub version: i64,
}

impl Request {
    /// Create a request with no options
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn with_option_1(mut self, value: impl Into<String>) -> Self {
        self.option_1 = value.into();
        self
    }

    pub fn with_option_2(mut self, value: impl Into<String>) -> Self {
        self.option_2 = value.into();
        self
    }

    pub fn with_version(mut self, version: i64) -> Self {
        self.version = version;
        self
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(action::GET).with_option_1(key)
    }

    pub fn set(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(action::SET).with_option_1(key).with_option_2(value)
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self::new(action::REMOVE).with_option_1(key)
    }

    pub fn list() -> Self {
        Self::new(action::LIST)
    }

    pub fn ping() -> Self {
        Self::new(action::PING)
    }

    /// Discovery broadcast carrying the given peer addresses
    pub fn nodes(addresses: &[String]) -> Result<Self, serde_json::Error> {
        Ok(Self::new(action::NODES).with_option_1(serde_json::to_string(addresses)?))
    }

    /// Replicated write of `key` at `version`
    pub fn updated(key: impl Into<String>, value: impl Into<String>, version: i64) -> Self {
        Self::new(action::UPDATED)
            .with_option_1(key)
            .with_option_2(value)
            .with_version(version)
    }

    /// Replicated removal of `key` at `version`
    pub fn removed(key: impl Into<String>, version: i64) -> Self {
        Self::new(action::REMOVED).with_option_1(key).with_version(version)
    }

    /// Announce `address` as a new replication peer
    pub fn register(address: impl Into<String>) -> Self {
        Self::new(action::REGISTER).with_option_1(address)
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

/// Application response carried inside an [`Envelope`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub success: bool,
    #[serde(default)]
    pub error: String,
    #[serde(default)]
    pub result: String,
}

impl Response {
    pub fn ok(result: impl Into<String>) -> Self {
        Self {
            success: true,
            error: String::new(),
            result: result.into(),
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: error.into(),
            result: String::new(),
        }
    }

    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_wire_format() {
        let env = Envelope::new(7, r#"{"action":"PING"}"#);
        let text = env.to_text().unwrap();

        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["request_id"], 7);
        assert_eq!(value["payload"], r#"{"action":"PING"}"#);
        assert!(!text.contains('\n'));
    }

    #[test]
    fn test_request_missing_fields_default() {
        let req = Request::from_bytes(br#"{"action":"LIST"}"#).unwrap();
        assert_eq!(req.action, action::LIST);
        assert_eq!(req.option_1, "");
        assert_eq!(req.version, 0);
    }

    #[test]
    fn test_replication_request_carries_version() {
        let req = Request::updated("k", "v", 9);
        let text = req.to_text().unwrap();
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();

        assert_eq!(value["action"], "updated");
        assert_eq!(value["option_1"], "k");
        assert_eq!(value["option_2"], "v");
        assert_eq!(value["version"], 9);
    }

    #[test]
    fn test_nodes_request_encodes_address_list() {
        let req = Request::nodes(&["a:1".to_string(), "b:2".to_string()]).unwrap();
        let addrs: Vec<String> = serde_json::from_str(&req.option_1).unwrap();
        assert_eq!(addrs, vec!["a:1", "b:2"]);
    }
}

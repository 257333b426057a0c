//! Health probe for a running node
//!
//! This is the capability an external supervisor needs: check that a node
//! answers and hand it the current member list.

use tracing::debug;

use crate::client::{ClientError, RpcClient};
use crate::config::TransportConfig;
use crate::types::{Request, CLIENT_PATH};

/// Connection to a node's client endpoint used for supervision
pub struct NodeProbe {
    client: RpcClient,
}

impl NodeProbe {
    pub async fn connect(address: &str, config: &TransportConfig) -> Result<Self, ClientError> {
        let client = RpcClient::connect(address, CLIENT_PATH, config).await?;
        Ok(Self { client })
    }

    pub fn address(&self) -> &str {
        self.client.address()
    }

    /// Whether the node answers `PING` successfully
    pub async fn ping(&self) -> bool {
        match self.client.send_sync(&Request::ping()).await {
            Ok(resp) => resp.success,
            Err(e) => {
                debug!("Probe: ping {} failed: {}", self.address(), e);
                false
            }
        }
    }

    /// Send the member list to the node as a `NODES` broadcast
    pub async fn announce_peers(&self, addresses: &[String]) -> Result<(), ClientError> {
        self.client.call(&Request::nodes(addresses)?).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.client.close().await;
    }
}

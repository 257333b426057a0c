//! Typed RPC client
//!
//! Speaks [`Request`]/[`Response`] on top of a [`TransportClient`]. Used by
//! replication, the health probe and the command line client alike.

use std::time::Duration;

use thiserror::Error;
use tracing::debug;

use crate::config::TransportConfig;
use crate::transport::{TransportClient, TransportError};
use crate::types::{Request, Response};

/// Errors from an RPC call
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// The peer answered with something that is not a response
    #[error("undecodable response '{raw}': {source}")]
    Decode {
        raw: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("encode error: {0}")]
    Encode(#[from] serde_json::Error),

    /// The peer handled the request and reported a failure
    #[error("remote error: {0}")]
    Remote(String),
}

/// Request/response client bound to one endpoint
pub struct RpcClient {
    transport: TransportClient,
    call_timeout: Duration,
}

impl RpcClient {
    /// Connect to `path` on `address`
    pub async fn connect(
        address: &str,
        path: &str,
        config: &TransportConfig,
    ) -> Result<Self, ClientError> {
        let transport = TransportClient::connect(address, path, config).await?;
        Ok(Self {
            transport,
            call_timeout: config.call_timeout,
        })
    }

    pub fn address(&self) -> &str {
        self.transport.address()
    }

    pub fn is_closed(&self) -> bool {
        self.transport.is_closed()
    }

    /// Send `request` and wait for the raw response
    pub async fn send_sync(&self, request: &Request) -> Result<Response, ClientError> {
        let payload = request.to_text()?;
        let raw = self.transport.send_sync(payload, self.call_timeout).await?;

        debug!("Client: {} -> {}", request.action, raw);

        Response::from_bytes(raw.as_bytes()).map_err(|source| ClientError::Decode { raw, source })
    }

    /// Send `request` and return its result, turning `success=false` into an
    /// error
    pub async fn call(&self, request: &Request) -> Result<String, ClientError> {
        let response = self.send_sync(request).await?;
        if response.success {
            Ok(response.result)
        } else {
            Err(ClientError::Remote(response.error))
        }
    }

    pub async fn close(&self) {
        self.transport.close().await;
    }
}

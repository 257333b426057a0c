//! Correlated request/response transport over WebSocket
//!
//! Each frame carries an [`Envelope`] `{request_id, payload}`. The client side
//! keeps a table of pending requests keyed by id, so any number of calls can
//! be in flight on one connection and responses may arrive in any order. A
//! pending entry is settled exactly once: by its matching response or by its
//! timeout, whichever comes first.
//!
//! The server side hands every inbound payload to a [`Router`] and writes the
//! result back under the same id.

use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request as HandshakeRequest, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{accept_hdr_async, connect_async, WebSocketStream};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::TransportConfig;
use crate::router::Router;
use crate::types::Envelope;

/// Errors in the correlated transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to connect to {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: tungstenite::Error,
    },

    /// The WebSocket handshake did not finish in time
    #[error("handshake with {address} timed out after {timeout:?}")]
    DialTimeout { address: String, timeout: Duration },

    /// The request expired in the pending table
    #[error("request {request_id} timed out")]
    Timeout { request_id: i64 },

    /// The caller stopped waiting
    #[error("no response within {0:?}")]
    WaitTimeout(Duration),

    #[error("connection closed")]
    ConnectionClosed,
}

impl TransportError {
    /// Whether the peer never answered, as opposed to failing otherwise
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransportError::Timeout { .. }
                | TransportError::WaitTimeout(_)
                | TransportError::DialTimeout { .. }
        )
    }
}

type PendingTable = Arc<Mutex<HashMap<i64, oneshot::Sender<String>>>>;

/// Build the WebSocket URL for `address` and `path`
pub fn build_url(address: &str, path: &str) -> String {
    format!("ws://{}/{}", address, path.trim_start_matches('/'))
}

/// Response to a request sent with [`TransportClient::send`]
#[derive(Debug)]
pub struct ResponseFuture {
    request_id: i64,
    rx: oneshot::Receiver<String>,
}

impl ResponseFuture {
    pub fn request_id(&self) -> i64 {
        self.request_id
    }
}

impl Future for ResponseFuture {
    type Output = Result<String, TransportError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let request_id = self.request_id;
        // The sender is only dropped without a value when the entry expires
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|r| r.map_err(|_| TransportError::Timeout { request_id }))
    }
}

/// Client half of a correlated connection
pub struct TransportClient {
    address: String,
    next_id: AtomicI64,
    pending: PendingTable,
    outgoing: mpsc::Sender<Message>,
    closed: Arc<AtomicBool>,
    reader: Mutex<Option<JoinHandle<()>>>,
    request_timeout: Duration,
}

impl TransportClient {
    /// Dial `ws://{address}/{path}`
    pub async fn connect(
        address: &str,
        path: &str,
        config: &TransportConfig,
    ) -> Result<Self, TransportError> {
        let url = build_url(address, path);
        let dial = tokio::time::timeout(config.connect_timeout, connect_async(url.as_str()));
        let (ws, _) = dial
            .await
            .map_err(|_| TransportError::DialTimeout {
                address: address.to_string(),
                timeout: config.connect_timeout,
            })?
            .map_err(|source| TransportError::Dial {
                address: address.to_string(),
                source,
            })?;

        debug!("Transport: connected to {}", url);
        Ok(Self::from_stream(address, ws, config))
    }

    /// Wrap an already established WebSocket stream
    pub fn from_stream<S>(address: &str, ws: WebSocketStream<S>, config: &TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (sink, stream) = ws.split();
        let (outgoing, outgoing_rx) = mpsc::channel(config.send_queue);
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(write_messages(sink, outgoing_rx, config.keepalive_interval));
        let reader = tokio::spawn(read_responses(
            stream,
            pending.clone(),
            closed.clone(),
            address.to_string(),
        ));

        Self {
            address: address.to_string(),
            next_id: AtomicI64::new(0),
            pending,
            outgoing,
            closed,
            reader: Mutex::new(Some(reader)),
            request_timeout: config.request_timeout,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Whether the read side has stopped
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Number of requests still awaiting a response or expiry
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send `payload` and return a future for its response.
    ///
    /// The entry is dropped from the pending table after the configured
    /// request timeout, which resolves the future with
    /// [`TransportError::Timeout`].
    pub async fn send(&self, payload: impl Into<String>) -> Result<ResponseFuture, TransportError> {
        if self.is_closed() {
            return Err(TransportError::ConnectionClosed);
        }

        let request_id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let text = Envelope::new(request_id, payload).to_text()?;

        let (tx, rx) = oneshot::channel();
        // Registered before writing so a fast response cannot miss its slot
        self.pending.lock().insert(request_id, tx);

        if self.outgoing.send(Message::text(text)).await.is_err() {
            self.pending.lock().remove(&request_id);
            return Err(TransportError::ConnectionClosed);
        }

        let pending = self.pending.clone();
        let timeout = self.request_timeout;
        let address = self.address.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if pending.lock().remove(&request_id).is_some() {
                debug!("Transport: request {} to {} expired", request_id, address);
            }
        });

        Ok(ResponseFuture { request_id, rx })
    }

    /// Send `payload` and wait at most `timeout` for the response
    pub async fn send_sync(
        &self,
        payload: impl Into<String>,
        timeout: Duration,
    ) -> Result<String, TransportError> {
        let response = self.send(payload).await?;
        match tokio::time::timeout(timeout, response).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::WaitTimeout(timeout)),
        }
    }

    /// Stop reading and close the connection.
    ///
    /// Pending requests are left to expire on their own timeouts.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
        let _ = self.outgoing.send(Message::Close(None)).await;
    }
}

/// Settle the pending entry matching an inbound envelope
fn resolve_response(pending: &PendingTable, data: &[u8], address: &str) {
    let envelope = match Envelope::from_bytes(data) {
        Ok(env) => env,
        Err(e) => {
            warn!(
                "Transport: undecodable frame from {}: {} ({})",
                address,
                String::from_utf8_lossy(data),
                e
            );
            return;
        }
    };

    let slot = pending.lock().remove(&envelope.request_id);
    match slot {
        Some(tx) => {
            let _ = tx.send(envelope.payload);
        }
        None => {
            debug!(
                "Transport: dropping late response {} from {}",
                envelope.request_id, address
            );
        }
    }
}

async fn read_responses<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    pending: PendingTable,
    closed: Arc<AtomicBool>,
    address: String,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => resolve_response(&pending, text.as_bytes(), &address),
            Ok(Message::Binary(data)) => resolve_response(&pending, &data, &address),
            Ok(Message::Close(_)) => {
                debug!("Transport: {} closed the connection", address);
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Transport: read from {} failed: {}", address, e);
                break;
            }
        }
    }

    closed.store(true, Ordering::SeqCst);
}

/// Drain `rx` into the socket, pinging every `keepalive` while idle
async fn write_messages<S>(
    mut sink: SplitSink<WebSocketStream<S>, Message>,
    mut rx: mpsc::Receiver<Message>,
    keepalive: Duration,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut ticker = interval_at(Instant::now() + keepalive, keepalive);

    loop {
        tokio::select! {
            msg = rx.recv() => {
                let Some(msg) = msg else {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                };
                let is_close = matches!(msg, Message::Close(_));
                if let Err(e) = sink.send(msg).await {
                    debug!("Transport: write failed: {}", e);
                    break;
                }
                if is_close {
                    break;
                }
            }
            _ = ticker.tick() => {
                if let Err(e) = sink.send(Message::Ping(Vec::new())).await {
                    debug!("Transport: keepalive failed: {}", e);
                    break;
                }
            }
        }
    }
}

/// Unwrap an inbound envelope, route its payload and wrap the reply.
///
/// Undecodable envelopes produce a diagnostic string instead.
pub fn handle_envelope(router: &Router, data: &[u8]) -> String {
    let envelope = match Envelope::from_bytes(data) {
        Ok(env) => env,
        Err(e) => {
            let msg = format!(
                "message '{}' parse failed: {}",
                String::from_utf8_lossy(data),
                e
            );
            warn!("Transport: {}", msg);
            return msg;
        }
    };

    let payload = router.dispatch(envelope.payload.as_bytes());
    match Envelope::new(envelope.request_id, payload).to_text() {
        Ok(text) => text,
        Err(e) => {
            let msg = format!("response {} encode failed: {}", envelope.request_id, e);
            error!("Transport: {}", msg);
            msg
        }
    }
}

/// Serve one accepted connection until the peer goes away.
///
/// Every request is dispatched on its own task so a slow handler does not
/// hold up the read loop.
pub async fn serve_connection<S>(
    ws: WebSocketStream<S>,
    router: Arc<Router>,
    config: TransportConfig,
    peer: String,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let conn_id = Uuid::new_v4();
    debug!("Transport: serving {} (conn {})", peer, conn_id);

    let (sink, mut stream) = ws.split();
    let (tx, rx) = mpsc::channel(config.send_queue);
    let writer = tokio::spawn(write_messages(sink, rx, config.keepalive_interval));

    while let Some(msg) = stream.next().await {
        let data = match msg {
            Ok(m @ (Message::Text(_) | Message::Binary(_))) => m.into_data(),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Transport: conn {} read failed: {}", conn_id, e);
                break;
            }
        };

        let router = router.clone();
        let tx = tx.clone();
        tokio::spawn(async move {
            let reply = handle_envelope(&router, &data);
            let _ = tx.send(Message::text(reply)).await;
        });
    }

    drop(tx);
    let _ = writer.await;
    debug!("Transport: conn {} from {} closed", conn_id, peer);
}

/// Path-routed WebSocket listener
pub struct Server {
    listener: TcpListener,
    routes: HashMap<String, Arc<Router>>,
    config: TransportConfig,
}

impl Server {
    /// Bind a listener on `addr`
    pub async fn bind(addr: &str, config: TransportConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            listener,
            routes: HashMap::new(),
            config,
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, TransportError> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve `router` on `/{path}`
    pub fn route(mut self, path: &str, router: Arc<Router>) -> Self {
        self.routes
            .insert(format!("/{}", path.trim_start_matches('/')), router);
        self
    }

    /// Accept connections forever
    pub async fn run(self) {
        let routes = Arc::new(self.routes);
        if let Ok(addr) = self.listener.local_addr() {
            info!("Transport: listening on {}", addr);
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    tokio::spawn(accept_connection(
                        stream,
                        peer,
                        routes.clone(),
                        self.config.clone(),
                    ));
                }
                Err(e) => {
                    error!("Transport: accept failed: {}", e);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

async fn accept_connection(
    stream: TcpStream,
    peer: SocketAddr,
    routes: Arc<HashMap<String, Arc<Router>>>,
    config: TransportConfig,
) {
    let mut selected: Option<Arc<Router>> = None;

    let callback = |req: &HandshakeRequest,
                    resp: HandshakeResponse|
     -> Result<HandshakeResponse, ErrorResponse> {
        let path = req.uri().path();
        match routes.get(path) {
            Some(router) => {
                selected = Some(router.clone());
                Ok(resp)
            }
            None => {
                let mut err = ErrorResponse::new(Some(format!("no route for {}", path)));
                *err.status_mut() = StatusCode::NOT_FOUND;
                Err(err)
            }
        }
    };

    let handshake = tokio::time::timeout(config.connect_timeout, accept_hdr_async(stream, callback));
    let ws = match handshake.await {
        Ok(Ok(ws)) => ws,
        Ok(Err(e)) => {
            warn!("Transport: handshake with {} failed: {}", peer, e);
            return;
        }
        Err(_) => {
            warn!(
                "Transport: handshake with {} timed out after {:?}",
                peer, config.connect_timeout
            );
            return;
        }
    };

    if let Some(router) = selected {
        serve_connection(ws, router, config, peer.to_string()).await;
    }
}

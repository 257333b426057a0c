//! Action router
//!
//! Maps an action name to a handler and turns encoded requests into encoded
//! responses. The router knows nothing about request ids; correlation is the
//! transport's job.

use std::collections::HashMap;

use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Request, Response};

/// Errors a handler can report back to the caller
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("unexpected action: {0}")]
    UnexpectedAction(String),

    #[error("item not exists")]
    ItemNotFound,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Handler bound to an action
pub type Handler = Box<dyn Fn(&Request) -> Result<String, HandlerError> + Send + Sync>;

/// Action name to handler mapping
#[derive(Default)]
pub struct Router {
    routes: HashMap<String, Handler>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `handler` to `action`, replacing any previous binding
    pub fn add_route<F>(&mut self, action: impl Into<String>, handler: F)
    where
        F: Fn(&Request) -> Result<String, HandlerError> + Send + Sync + 'static,
    {
        self.routes.insert(action.into(), Box::new(handler));
    }

    /// Builder form of [`Router::add_route`]
    pub fn route<F>(mut self, action: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Request) -> Result<String, HandlerError> + Send + Sync + 'static,
    {
        self.add_route(action, handler);
        self
    }

    pub fn has_route(&self, action: &str) -> bool {
        self.routes.contains_key(action)
    }

    /// Run the handler for `request.action`
    pub fn handle(&self, request: &Request) -> Response {
        let outcome = match self.routes.get(&request.action) {
            Some(handler) => handler(request),
            None => Err(HandlerError::UnexpectedAction(request.action.clone())),
        };

        match outcome {
            Ok(result) => Response::ok(result),
            Err(e) => {
                debug!("Router: {} failed: {}", request.action, e);
                Response::failure(e.to_string())
            }
        }
    }

    /// Decode `message`, handle it and encode the response.
    ///
    /// Undecodable input yields a diagnostic string instead of a response so
    /// the sender still learns what went wrong.
    pub fn dispatch(&self, message: &[u8]) -> String {
        let request = match Request::from_bytes(message) {
            Ok(r) => r,
            Err(e) => {
                let msg = format!(
                    "message '{}' parse failed: {}",
                    String::from_utf8_lossy(message),
                    e
                );
                warn!("Router: {}", msg);
                return msg;
            }
        };

        let response = self.handle(&request);
        match response.to_text() {
            Ok(text) => text,
            Err(e) => {
                let msg = format!("response for '{}' encode failed: {}", request.action, e);
                warn!("Router: {}", msg);
                msg
            }
        }
    }
}

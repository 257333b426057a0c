//! shardkv core library
//!
//! Replicated key-value store where every node holds the full keyspace.
//! Local writes are versioned per key and pushed to all known peers, which
//! keep whichever write carries the higher version (last-writer-wins).
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │ replication   peer set, fan-out, discovery  │
//! ├──────────────────────┬──────────────────────┤
//! │ store                │ router               │
//! │ sharded, versioned   │ action -> handler    │
//! ├──────────────────────┴──────────────────────┤
//! │ transport   {request_id, payload} over WS   │
//! └─────────────────────────────────────────────┘
//! ```
//!
//! Convergence is eventual and best-effort: there is no quorum, no retry and
//! no causal metadata beyond the per-key version.

pub mod types;
pub mod config;
pub mod store;
pub mod router;
pub mod transport;
pub mod client;
pub mod handlers;
pub mod replication;
pub mod persistence;
pub mod health;
pub mod node;

pub use types::*;
pub use config::{NodeConfig, PersistenceConfig, StoreConfig, TransportConfig};
pub use store::{Record, Store, MAX_VERSION};
pub use router::{HandlerError, Router};
pub use transport::{Server, TransportClient, TransportError};
pub use client::{ClientError, RpcClient};
pub use replication::{ReplicationClient, ReplicationServer};
pub use persistence::{PersistenceError, Persister};
pub use health::NodeProbe;
pub use node::{Node, NodeError};

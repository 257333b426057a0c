//! Replication between shardkv nodes
//!
//! - `client`: peer set, fan-out of local changes, discovery
//! - `server`: applies replicated changes with the last-writer-wins rule
//!
//! Propagation is best-effort: each change is sent at most once to each known
//! peer, failures are logged and never retried, and the local write that
//! triggered it is never held up.

pub mod client;
pub mod server;

pub use client::{PeerNode, ReplicationClient};
pub use server::ReplicationServer;

//! Sharded versioned key-value store
//!
//! Every key maps to a [`Record`] holding its value and a per-key version
//! counter. Keys are spread over a fixed number of shards, each behind its own
//! lock, so contention is limited to keys that hash to the same shard.
//!
//! Two families of writes exist:
//! - local writes (`set`, `remove`) always succeed, bump the version and fire
//!   the change hooks so replication can pick them up;
//! - merge writes (`set_with_version`, `remove_with_version`) come from peers
//!   and are applied only when they carry a strictly newer version
//!   (last-writer-wins). They never fire hooks.
//!
//! Versions never exceed [`MAX_VERSION`]. Merge writes above it are refused
//! and local writes stop advancing once a key reaches it.

use std::collections::HashMap;
use std::hash::Hasher;
use std::sync::Arc;

use fnv::FnvHasher;
use parking_lot::RwLock;
use tracing::{trace, warn};

/// Default number of shards
pub const DEFAULT_SHARD_COUNT: usize = 32;

/// Highest version a record can hold.
///
/// One below `i64::MAX` so a removal at the ceiling still has a version to
/// announce.
pub const MAX_VERSION: i64 = i64::MAX - 1;

fn next_version(version: i64) -> i64 {
    version.saturating_add(1).min(MAX_VERSION)
}

/// Hook fired after an accepted local `set`: `(key, value, version)`
pub type SetHandler = Arc<dyn Fn(&str, &str, i64) + Send + Sync>;

/// Hook fired after an accepted local `remove`: `(key, version)`
pub type RemoveHandler = Arc<dyn Fn(&str, i64) + Send + Sync>;

/// Stored value together with its version
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub value: String,
    pub version: i64,
}

type Shard = RwLock<HashMap<String, Record>>;

/// Sharded store with change hooks.
///
/// Hooks run on the caller's thread once the shard lock is released. They
/// must not block; replication hands the event to a background task.
pub struct Store {
    shards: Vec<Shard>,
    set_handlers: RwLock<Vec<SetHandler>>,
    remove_handlers: RwLock<Vec<RemoveHandler>>,
}

impl Default for Store {
    fn default() -> Self {
        Self::new(DEFAULT_SHARD_COUNT)
    }
}

impl Store {
    /// Create a store with `shard_count` shards (at least one)
    pub fn new(shard_count: usize) -> Self {
        let shard_count = shard_count.max(1);
        Self {
            shards: (0..shard_count).map(|_| RwLock::new(HashMap::new())).collect(),
            set_handlers: RwLock::new(Vec::new()),
            remove_handlers: RwLock::new(Vec::new()),
        }
    }

    pub fn shard_count(&self) -> usize {
        self.shards.len()
    }

    /// Shard a key belongs to. Stable for the lifetime of the store.
    pub fn shard_index(&self, key: &str) -> usize {
        let mut hasher = FnvHasher::default();
        hasher.write(key.as_bytes());
        (hasher.finish() % self.shards.len() as u64) as usize
    }

    fn shard(&self, key: &str) -> &Shard {
        &self.shards[self.shard_index(key)]
    }

    /// Register a hook for accepted local sets
    pub fn add_set_handler(&self, handler: SetHandler) {
        self.set_handlers.write().push(handler);
    }

    /// Register a hook for accepted local removals
    pub fn add_remove_handler(&self, handler: RemoveHandler) {
        self.remove_handlers.write().push(handler);
    }

    /// Local write. Always accepted, bumps the key's version.
    pub fn set(&self, key: &str, value: &str) -> i64 {
        let version = {
            let mut shard = self.shard(key).write();
            match shard.get_mut(key) {
                Some(record) => {
                    record.version = next_version(record.version);
                    record.value = value.to_string();
                    record.version
                }
                None => {
                    shard.insert(
                        key.to_string(),
                        Record {
                            value: value.to_string(),
                            version: 1,
                        },
                    );
                    1
                }
            }
        };

        trace!("Store: set {} (v{})", key, version);

        let handlers = self.set_handlers.read().clone();
        for handler in handlers {
            handler(key, value, version);
        }

        version
    }

    /// Current value of `key`. Never changes the stored version.
    pub fn get(&self, key: &str) -> Option<String> {
        self.shard(key).read().get(key).map(|r| r.value.clone())
    }

    /// Current value and version of `key`
    pub fn get_record(&self, key: &str) -> Option<Record> {
        self.shard(key).read().get(key).cloned()
    }

    /// Local removal. Returns whether the key existed.
    ///
    /// The remove hook receives `version + 1` so that peers holding the last
    /// written version accept the removal.
    pub fn remove(&self, key: &str) -> bool {
        let removed = self.shard(key).write().remove(key);

        let Some(record) = removed else {
            return false;
        };

        let version = next_version(record.version);
        trace!("Store: remove {} (v{})", key, version);

        let handlers = self.remove_handlers.read().clone();
        for handler in handlers {
            handler(key, version);
        }

        true
    }

    /// Merge write from a peer. Applied when the key is absent or `version`
    /// is strictly newer than the stored one. Returns whether it was applied.
    pub fn set_with_version(&self, key: &str, value: &str, version: i64) -> bool {
        if version > MAX_VERSION {
            warn!("Store: refusing {} at out-of-range version {}", key, version);
            return false;
        }

        let mut shard = self.shard(key).write();
        match shard.get_mut(key) {
            Some(record) if record.version < version => {
                record.value = value.to_string();
                record.version = version;
                true
            }
            Some(_) => false,
            None => {
                shard.insert(
                    key.to_string(),
                    Record {
                        value: value.to_string(),
                        version,
                    },
                );
                true
            }
        }
    }

    /// Merge removal from a peer. Applied only when the key is present with an
    /// older version. Returns whether the key was removed.
    pub fn remove_with_version(&self, key: &str, version: i64) -> bool {
        if version > MAX_VERSION {
            warn!("Store: refusing removal of {} at out-of-range version {}", key, version);
            return false;
        }

        let mut shard = self.shard(key).write();
        match shard.get(key) {
            Some(record) if record.version < version => {
                shard.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Snapshot of all values, taken shard by shard.
    ///
    /// Shards are read one after another, so the result is not a single
    /// atomic view of the whole store.
    pub fn list(&self) -> HashMap<String, String> {
        let mut result = HashMap::new();
        for shard in &self.shards {
            let shard = shard.read();
            result.extend(shard.iter().map(|(k, r)| (k.clone(), r.value.clone())));
        }
        result
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.read().is_empty())
    }
}

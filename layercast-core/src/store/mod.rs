//! Shared key-value store backends for presence records
//!
//! The registry only needs a handful of primitives from the store: writes with
//! a TTL, reads that tell "absent" apart from failure, deletes, TTL refreshes
//! and a cursor-paginated pattern scan.

pub mod factory;
pub mod memory;
pub mod redis;

use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use factory::StoreBuilder;
pub use memory::MemoryPresenceStore;
pub use self::redis::RedisPresenceStore;

/// One page of a cursor scan. A returned cursor of `0` means the scan is done.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanPage {
    pub cursor: u64,
    pub keys: Vec<String>,
}

#[async_trait]
pub trait PresenceStore: Send + Sync {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Returns `None` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Returns `false` when the key does not exist.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage>;
}

pub type DynPresenceStore = Arc<dyn PresenceStore>;

//! Layercast Core - peer layer-presence registry
//!
//! Nodes announce which content-addressed layers they hold as TTL-bound
//! records in a shared key-value store, and look up which peers hold a layer
//! before falling back to a central origin.

pub mod error;
pub mod keeper;
pub mod peers;
pub mod registry;
pub mod store;

pub use error::{AggregateError, LayercastError, Result};
pub use keeper::LayerKeeper;
pub use peers::{DnsPeers, DynPeerDiscovery, PeerDiscovery, StaticPeers};
pub use registry::{
    DEFAULT_EXPIRATION, DEFAULT_LOOKUP_CONCURRENCY, DEFAULT_SCAN_COUNT, LayerRegistry,
    PRESENCE_KEY_PREFIX, PRESENCE_SCAN_PATTERN, presence_key,
};
pub use store::{
    DynPresenceStore, MemoryPresenceStore, PresenceStore, RedisPresenceStore, ScanPage,
    StoreBuilder,
};
pub use tokio_util::sync::CancellationToken;

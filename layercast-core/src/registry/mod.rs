//! Layer presence registry
//!
//! Each node announces the layers it holds as TTL-bound records in the shared
//! store, keyed by `layer:{owner}:{layer}` with the owner's own address as the
//! value. Lookups read every known peer's key for a layer directly, so no
//! index has to be maintained beyond the records themselves.

use crate::peers::DynPeerDiscovery;
use crate::store::DynPresenceStore;
use crate::{LayercastError, Result};
use futures_util::{StreamExt, TryStreamExt, stream};
use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const PRESENCE_KEY_PREFIX: &str = "layer:";
pub const PRESENCE_SCAN_PATTERN: &str = "layer:*";

pub const DEFAULT_EXPIRATION: Duration = Duration::from_secs(600);
pub const DEFAULT_SCAN_COUNT: usize = 100;
pub const DEFAULT_LOOKUP_CONCURRENCY: usize = 16;

/// Store key of the record announcing that `owner` holds `layer`.
pub fn presence_key(owner: &str, layer: &str) -> String {
    format!("{}{}:{}", PRESENCE_KEY_PREFIX, owner, layer)
}

pub struct LayerRegistry {
    self_address: String,
    peers: DynPeerDiscovery,
    store: DynPresenceStore,
    expiration: Duration,
    scan_count: usize,
    lookup_concurrency: usize,
}

impl LayerRegistry {
    pub fn new(
        self_address: impl Into<String>,
        peers: DynPeerDiscovery,
        store: DynPresenceStore,
        expiration: Duration,
    ) -> Self {
        Self {
            self_address: self_address.into(),
            peers,
            store,
            expiration,
            scan_count: DEFAULT_SCAN_COUNT,
            lookup_concurrency: DEFAULT_LOOKUP_CONCURRENCY,
        }
    }

    /// Keys requested per SCAN page during [`LayerRegistry::dump`].
    pub fn with_scan_count(mut self, scan_count: usize) -> Self {
        self.scan_count = scan_count.max(1);
        self
    }

    /// Upper bound on peer records read at once during [`LayerRegistry::get`].
    pub fn with_lookup_concurrency(mut self, concurrency: usize) -> Self {
        self.lookup_concurrency = concurrency.max(1);
        self
    }

    pub fn self_address(&self) -> &str {
        &self.self_address
    }

    pub fn expiration(&self) -> Duration {
        self.expiration
    }

    /// Announces that this node holds `layers`.
    ///
    /// Stops at the first failed write. Records written before the failure
    /// stay in place.
    pub async fn add<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        layers: &[S],
    ) -> Result<()> {
        for layer in layers {
            let layer = layer.as_ref();
            let key = presence_key(&self.self_address, layer);
            let write = self
                .store
                .set_with_expiry(&key, &self.self_address, self.expiration);
            cancellable(cancel, write).await?;
            tracing::debug!("Announced layer {} as {}", layer, self.self_address);
        }
        Ok(())
    }

    /// Withdraws this node's records for `layers`.
    ///
    /// Every layer is attempted even if some deletions fail; the failures are
    /// reported together. Layers that were never announced are not an error.
    pub async fn remove<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        layers: &[S],
    ) -> Result<()> {
        let mut errors = Vec::new();
        for layer in layers {
            let layer = layer.as_ref();
            let key = presence_key(&self.self_address, layer);
            match cancellable(cancel, self.store.delete(&key)).await {
                Ok(()) => tracing::debug!("Withdrew layer {}", layer),
                Err(LayercastError::Cancelled) => return Err(LayercastError::Cancelled),
                Err(error) => {
                    tracing::warn!("Failed to withdraw layer {}: {}", layer, error);
                    errors.push(error);
                }
            }
        }
        LayercastError::combine(errors)
    }

    /// Restarts the TTL of this node's records for `layers` without touching
    /// their values. Stops at the first failure.
    ///
    /// A record that no longer exists is not recreated. Such layers are
    /// returned so the caller can add them again.
    pub async fn reset_expiration<S: AsRef<str>>(
        &self,
        cancel: &CancellationToken,
        layers: &[S],
    ) -> Result<Vec<String>> {
        let mut lapsed = Vec::new();
        for layer in layers {
            let layer = layer.as_ref();
            let key = presence_key(&self.self_address, layer);
            let refreshed =
                cancellable(cancel, self.store.expire(&key, self.expiration)).await?;
            if !refreshed {
                tracing::warn!("Presence record for layer {} already expired", layer);
                lapsed.push(layer.to_string());
            }
        }
        Ok(lapsed)
    }

    /// Returns the addresses of other nodes currently announcing `layer`.
    ///
    /// This node is never part of the result. A peer without a record is
    /// skipped; any other store failure fails the whole lookup.
    pub async fn get(&self, cancel: &CancellationToken, layer: &str) -> Result<Vec<String>> {
        let peers = cancellable(cancel, self.peers.peers()).await?;
        tracing::debug!("Looking for layer {} among {} peers", layer, peers.len());

        let candidates: BTreeSet<String> = peers
            .into_iter()
            .filter(|peer| peer != &self.self_address)
            .collect();

        let lookups = candidates.into_iter().map(|peer| {
            let key = presence_key(&peer, layer);
            async move {
                let value = self.store.get(&key).await?;
                Ok::<_, LayercastError>(value.map(|owner| (peer, owner)))
            }
        });

        let found: Vec<Option<(String, String)>> = cancellable(
            cancel,
            stream::iter(lookups)
                .buffer_unordered(self.lookup_concurrency)
                .try_collect(),
        )
        .await?;

        let owners = found
            .into_iter()
            .flatten()
            .map(|(peer, owner)| {
                if peer != owner {
                    tracing::warn!("Presence record for peer {} names owner {}", peer, owner);
                }
                owner
            })
            .collect();

        Ok(owners)
    }

    /// Lists the raw keys of every live presence record in the store,
    /// across all owners, one SCAN page at a time.
    pub async fn dump(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut cursor = 0u64;
        let mut pages = 0usize;

        loop {
            let scan = self
                .store
                .scan(cursor, PRESENCE_SCAN_PATTERN, self.scan_count);
            let page = cancellable(cancel, scan).await?;
            pages += 1;
            keys.extend(page.keys);
            cursor = page.cursor;
            if cursor == 0 {
                break;
            }
        }

        tracing::debug!("Dumped {} presence keys in {} pages", keys.len(), pages);
        Ok(keys)
    }
}

/// Races `fut` against the caller's cancellation token. A fired token wins
/// even when the call is also ready.
async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LayercastError::Cancelled),
        result = fut => result,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peers::{PeerDiscovery, StaticPeers};
    use crate::store::{MemoryPresenceStore, PresenceStore, ScanPage};
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const NODE_A: &str = "10.0.0.1";
    const NODE_B: &str = "10.0.0.2";
    const NODE_C: &str = "10.0.0.3";
    const LAYER: &str = "sha256:deadbeef";

    fn fleet() -> Arc<StaticPeers> {
        Arc::new(StaticPeers::new([NODE_A, NODE_B, NODE_C]))
    }

    fn registry(address: &str, store: Arc<dyn PresenceStore>) -> LayerRegistry {
        LayerRegistry::new(address, fleet(), store, Duration::from_secs(600))
    }

    /// Fails every call touching a key that contains one of `poisoned`.
    #[derive(Default)]
    struct FlakyStore {
        inner: MemoryPresenceStore,
        poisoned: Vec<String>,
        calls: AtomicUsize,
    }

    impl FlakyStore {
        fn poisoned(layers: &[&str]) -> Self {
            Self {
                poisoned: layers.iter().map(|layer| layer.to_string()).collect(),
                ..Self::default()
            }
        }

        fn check(&self, key: &str) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.poisoned.iter().any(|layer| key.ends_with(layer.as_str())) {
                return Err(LayercastError::Store(format!("connection reset on {}", key)));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl PresenceStore for FlakyStore {
        async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
            self.check(key)?;
            self.inner.set_with_expiry(key, value, ttl).await
        }

        async fn get(&self, key: &str) -> Result<Option<String>> {
            self.check(key)?;
            self.inner.get(key).await
        }

        async fn delete(&self, key: &str) -> Result<()> {
            self.check(key)?;
            self.inner.delete(key).await
        }

        async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
            self.check(key)?;
            self.inner.expire(key, ttl).await
        }

        async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.scan(cursor, pattern, count).await
        }
    }

    /// Never completes a write.
    #[derive(Default)]
    struct StalledStore {
        writes: AtomicUsize,
    }

    #[async_trait]
    impl PresenceStore for StalledStore {
        async fn set_with_expiry(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }

        async fn get(&self, _key: &str) -> Result<Option<String>> {
            Ok(None)
        }

        async fn delete(&self, _key: &str) -> Result<()> {
            Ok(())
        }

        async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
            Ok(false)
        }

        async fn scan(&self, _cursor: u64, _pattern: &str, _count: usize) -> Result<ScanPage> {
            Ok(ScanPage::default())
        }
    }

    struct BrokenDiscovery;

    #[async_trait]
    impl PeerDiscovery for BrokenDiscovery {
        async fn peers(&self) -> Result<Vec<String>> {
            Err(LayercastError::Discovery("membership unavailable".to_string()))
        }
    }

    #[test]
    fn test_presence_key_layout() {
        assert_eq!(
            presence_key(NODE_A, LAYER),
            "layer:10.0.0.1:sha256:deadbeef"
        );
        assert!(presence_key(NODE_B, "x").starts_with(PRESENCE_KEY_PREFIX));
    }

    #[tokio::test]
    async fn test_add_then_get_from_other_node_then_remove() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let node_a = registry(NODE_A, store.clone());
        let node_b = registry(NODE_B, store.clone());
        let cancel = CancellationToken::new();

        node_a.add(&cancel, &[LAYER]).await.unwrap();
        assert_eq!(
            store.get(&presence_key(NODE_A, LAYER)).await.unwrap().as_deref(),
            Some(NODE_A)
        );
        assert_eq!(node_b.get(&cancel, LAYER).await.unwrap(), vec![NODE_A]);

        node_a.remove(&cancel, &[LAYER]).await.unwrap();
        assert!(node_b.get(&cancel, LAYER).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_excludes_self() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let node_a = registry(NODE_A, store.clone());
        let node_b = registry(NODE_B, store.clone());
        let cancel = CancellationToken::new();

        node_a.add(&cancel, &[LAYER]).await.unwrap();
        node_b.add(&cancel, &[LAYER]).await.unwrap();

        assert_eq!(node_a.get(&cancel, LAYER).await.unwrap(), vec![NODE_B]);
        assert_eq!(node_b.get(&cancel, LAYER).await.unwrap(), vec![NODE_A]);

        let mut from_c = registry(NODE_C, store).get(&cancel, LAYER).await.unwrap();
        from_c.sort();
        assert_eq!(from_c, vec![NODE_A, NODE_B]);
    }

    #[tokio::test]
    async fn test_get_ignores_owners_outside_peer_list() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let cancel = CancellationToken::new();
        registry("10.9.9.9", store.clone())
            .add(&cancel, &[LAYER])
            .await
            .unwrap();

        let node_b = registry(NODE_B, store);
        assert!(node_b.get(&cancel, LAYER).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_get_collapses_duplicate_peers() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let cancel = CancellationToken::new();
        registry(NODE_A, store.clone())
            .add(&cancel, &[LAYER])
            .await
            .unwrap();

        let peers = Arc::new(StaticPeers::new([NODE_A, NODE_A, NODE_B]));
        let node_b = LayerRegistry::new(NODE_B, peers, store, Duration::from_secs(600));
        assert_eq!(node_b.get(&cancel, LAYER).await.unwrap(), vec![NODE_A]);
    }

    #[tokio::test]
    async fn test_get_returns_empty_when_nobody_holds_layer() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let node_b = registry(NODE_B, store);
        let peers = node_b
            .get(&CancellationToken::new(), "sha256:unknown")
            .await
            .unwrap();
        assert!(peers.is_empty());
    }

    #[tokio::test]
    async fn test_get_fails_when_discovery_fails() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let node_b = LayerRegistry::new(
            NODE_B,
            Arc::new(BrokenDiscovery),
            store,
            Duration::from_secs(600),
        );
        let err = node_b
            .get(&CancellationToken::new(), LAYER)
            .await
            .unwrap_err();
        assert!(matches!(err, LayercastError::Discovery(_)));
    }

    #[tokio::test]
    async fn test_get_fails_on_store_error_instead_of_partial_result() {
        let flaky = Arc::new(FlakyStore::poisoned(&[LAYER]));
        let cancel = CancellationToken::new();
        flaky
            .inner
            .set_with_expiry(&presence_key(NODE_A, LAYER), NODE_A, Duration::from_secs(60))
            .await
            .unwrap();

        let node_b = registry(NODE_B, flaky);
        let err = node_b.get(&cancel, LAYER).await.unwrap_err();
        assert!(matches!(err, LayercastError::Store(_)));
    }

    #[tokio::test]
    async fn test_add_stops_at_first_failure() {
        let flaky = Arc::new(FlakyStore::poisoned(&["sha256:bad"]));
        let node_a = registry(NODE_A, flaky.clone());
        let cancel = CancellationToken::new();

        let err = node_a
            .add(&cancel, &["sha256:one", "sha256:bad", "sha256:three"])
            .await
            .unwrap_err();
        assert!(matches!(err, LayercastError::Store(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        let first = flaky.inner.get(&presence_key(NODE_A, "sha256:one")).await;
        assert!(first.unwrap().is_some());
        let third = flaky.inner.get(&presence_key(NODE_A, "sha256:three")).await;
        assert!(third.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_add_empty_batch_is_noop() {
        let flaky = Arc::new(FlakyStore::default());
        let node_a = registry(NODE_A, flaky.clone());
        let empty: [&str; 0] = [];
        node_a.add(&CancellationToken::new(), &empty).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_remove_absent_and_present_layers() {
        let store = Arc::new(MemoryPresenceStore::new());
        let node_a = registry(NODE_A, store.clone());
        let cancel = CancellationToken::new();

        node_a.add(&cancel, &["sha256:present"]).await.unwrap();
        node_a
            .remove(&cancel, &["sha256:absent", "sha256:present"])
            .await
            .unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_attempts_every_layer_and_aggregates_failures() {
        let flaky = Arc::new(FlakyStore::poisoned(&["sha256:bad1", "sha256:bad2"]));
        let node_a = registry(NODE_A, flaky.clone());
        let cancel = CancellationToken::new();
        node_a.add(&cancel, &["sha256:good"]).await.unwrap();
        flaky.calls.store(0, Ordering::SeqCst);

        let err = node_a
            .remove(&cancel, &["sha256:bad1", "sha256:good", "sha256:bad2"])
            .await
            .unwrap_err();

        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert!(flaky.inner.is_empty().await);
        let LayercastError::Aggregate(aggregate) = err else {
            panic!("expected aggregate error");
        };
        assert_eq!(aggregate.errors().len(), 2);
    }

    #[tokio::test]
    async fn test_remove_single_failure_is_not_wrapped() {
        let flaky = Arc::new(FlakyStore::poisoned(&["sha256:bad"]));
        let node_a = registry(NODE_A, flaky);
        let err = node_a
            .remove(&CancellationToken::new(), &["sha256:bad", "sha256:other"])
            .await
            .unwrap_err();
        assert!(matches!(err, LayercastError::Store(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_expiration_keeps_record_alive() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let node_a = registry(NODE_A, store.clone());
        let node_b = registry(NODE_B, store);
        let cancel = CancellationToken::new();

        node_a.add(&cancel, &[LAYER, "sha256:stale"]).await.unwrap();

        tokio::time::advance(Duration::from_secs(400)).await;
        let lapsed = node_a.reset_expiration(&cancel, &[LAYER]).await.unwrap();
        assert!(lapsed.is_empty());

        tokio::time::advance(Duration::from_secs(400)).await;
        assert_eq!(node_b.get(&cancel, LAYER).await.unwrap(), vec![NODE_A]);
        assert!(node_b.get(&cancel, "sha256:stale").await.unwrap().is_empty());

        tokio::time::advance(Duration::from_secs(300)).await;
        assert!(node_b.get(&cancel, LAYER).await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_expiration_reports_lapsed_records() {
        let store = Arc::new(MemoryPresenceStore::new());
        let node_a = registry(NODE_A, store.clone());
        let cancel = CancellationToken::new();

        node_a.add(&cancel, &[LAYER]).await.unwrap();
        tokio::time::advance(Duration::from_secs(500)).await;
        node_a.add(&cancel, &["sha256:fresh"]).await.unwrap();
        tokio::time::advance(Duration::from_secs(101)).await;

        let lapsed = node_a
            .reset_expiration(&cancel, &[LAYER, "sha256:fresh"])
            .await
            .unwrap();
        assert_eq!(lapsed, vec![LAYER]);
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_reset_expiration_stops_at_first_failure() {
        let flaky = Arc::new(FlakyStore::poisoned(&["sha256:bad"]));
        let node_a = registry(NODE_A, flaky.clone());
        let err = node_a
            .reset_expiration(&CancellationToken::new(), &["sha256:bad", "sha256:next"])
            .await
            .unwrap_err();
        assert!(matches!(err, LayercastError::Store(_)));
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dump_paginates_across_owners() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let cancel = CancellationToken::new();

        let mut expected = Vec::new();
        for owner in [NODE_A, NODE_B, NODE_C] {
            let layers: Vec<String> = (0..9).map(|i| format!("sha256:{:04}", i)).collect();
            registry(owner, store.clone())
                .add(&cancel, &layers)
                .await
                .unwrap();
            expected.extend(layers.iter().map(|layer| presence_key(owner, layer)));
        }
        store
            .set_with_expiry("unrelated", "x", Duration::from_secs(60))
            .await
            .unwrap();

        let node_a = registry(NODE_A, store).with_scan_count(4);
        let mut keys = node_a.dump(&cancel).await.unwrap();
        keys.sort();
        expected.sort();
        assert_eq!(keys.len(), 27);
        assert_eq!(keys, expected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dump_skips_expired_records() {
        let store: Arc<dyn PresenceStore> = Arc::new(MemoryPresenceStore::new());
        let cancel = CancellationToken::new();
        let node_a = registry(NODE_A, store.clone());
        node_a.add(&cancel, &["sha256:old"]).await.unwrap();

        tokio::time::advance(Duration::from_secs(500)).await;
        registry(NODE_B, store).add(&cancel, &["sha256:new"]).await.unwrap();

        tokio::time::advance(Duration::from_secs(200)).await;
        let keys = node_a.dump(&cancel).await.unwrap();
        assert_eq!(keys, vec![presence_key(NODE_B, "sha256:new")]);
    }

    #[tokio::test]
    async fn test_cancelled_token_prevents_store_calls() {
        let flaky = Arc::new(FlakyStore::default());
        let node_a = registry(NODE_A, flaky.clone());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = node_a.add(&cancel, &[LAYER]).await.unwrap_err();
        assert!(err.is_cancelled());
        let err = node_a.remove(&cancel, &[LAYER]).await.unwrap_err();
        assert!(err.is_cancelled());
        let err = node_a.reset_expiration(&cancel, &[LAYER]).await.unwrap_err();
        assert!(err.is_cancelled());
        let err = node_a.get(&cancel, LAYER).await.unwrap_err();
        assert!(err.is_cancelled());
        let err = node_a.dump(&cancel).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 0);
        assert!(flaky.inner.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_aborts_in_flight_batch() {
        let stalled = Arc::new(StalledStore::default());
        let node_a = registry(NODE_A, stalled.clone());
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            trigger.cancel();
        });

        let err = node_a
            .add(&cancel, &["sha256:one", "sha256:two"])
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(stalled.writes.load(Ordering::SeqCst), 1);
    }
}

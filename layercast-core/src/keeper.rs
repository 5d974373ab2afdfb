use crate::{LayerRegistry, LayercastError, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Tracks the layers this node holds and keeps their presence records from
/// expiring.
pub struct LayerKeeper {
    registry: Arc<LayerRegistry>,
    refresh_interval: Duration,
    held: RwLock<BTreeSet<String>>,
}

impl LayerKeeper {
    pub fn new(registry: Arc<LayerRegistry>, refresh_interval: Duration) -> Result<Self> {
        if refresh_interval.is_zero() || refresh_interval >= registry.expiration() {
            return Err(LayercastError::Config(format!(
                "refresh interval {:?} must be non-zero and shorter than the expiration window {:?}",
                refresh_interval,
                registry.expiration()
            )));
        }

        Ok(Self {
            registry,
            refresh_interval,
            held: RwLock::new(BTreeSet::new()),
        })
    }

    pub fn registry(&self) -> &Arc<LayerRegistry> {
        &self.registry
    }

    /// Announces `layers` and starts refreshing them.
    pub async fn hold(&self, cancel: &CancellationToken, layers: &[String]) -> Result<()> {
        let mut held = self.held.write().await;
        self.registry.add(cancel, layers).await?;
        held.extend(layers.iter().cloned());
        tracing::info!("Holding {} layers ({} total)", layers.len(), held.len());
        Ok(())
    }

    /// Stops refreshing `layers` and withdraws their records.
    pub async fn release(&self, cancel: &CancellationToken, layers: &[String]) -> Result<()> {
        let mut held = self.held.write().await;
        for layer in layers {
            held.remove(layer);
        }
        tracing::info!("Released {} layers ({} left)", layers.len(), held.len());
        self.registry.remove(cancel, layers).await
    }

    pub async fn held(&self) -> Vec<String> {
        self.held.read().await.iter().cloned().collect()
    }

    /// Runs a single refresh pass over every held layer. Layers whose
    /// records have already lapsed are announced again.
    ///
    /// The held set stays locked for the whole pass so a concurrent release
    /// cannot be undone by a re-announcement.
    pub async fn refresh(&self, cancel: &CancellationToken) -> Result<usize> {
        let held = self.held.read().await;
        if held.is_empty() {
            return Ok(0);
        }

        let layers: Vec<&str> = held.iter().map(String::as_str).collect();
        let lapsed = self.registry.reset_expiration(cancel, &layers).await?;
        if !lapsed.is_empty() {
            tracing::info!("Re-announcing {} lapsed layers", lapsed.len());
            self.registry.add(cancel, &lapsed).await?;
        }

        tracing::debug!("Refreshed {} presence records", layers.len());
        Ok(layers.len())
    }

    /// Refreshes held layers every interval until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(self.refresh_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately; records were just written by hold().
        interval.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }

            if let Err(error) = self.refresh(&cancel).await {
                if error.is_cancelled() {
                    break;
                }
                tracing::warn!("Failed to refresh held layers: {}", error);
            }
        }

        tracing::info!("Layer keeper stopped");
    }
}

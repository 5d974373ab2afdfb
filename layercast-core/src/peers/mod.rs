//! Peer discovery backends
//!
//! The registry asks discovery for the current fleet on every lookup and
//! checks each returned address for the requested layer.

use crate::{LayercastError, Result};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::sync::Arc;

#[async_trait]
pub trait PeerDiscovery: Send + Sync {
    async fn peers(&self) -> Result<Vec<String>>;
}

pub type DynPeerDiscovery = Arc<dyn PeerDiscovery>;

/// Fixed list of peer addresses.
#[derive(Debug, Clone, Default)]
pub struct StaticPeers {
    addresses: Vec<String>,
}

impl StaticPeers {
    pub fn new(addresses: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl PeerDiscovery for StaticPeers {
    async fn peers(&self) -> Result<Vec<String>> {
        Ok(self.addresses.clone())
    }
}

/// Resolves a DNS name with one record per node, such as a headless service,
/// and returns each distinct IP address as a peer.
#[derive(Debug, Clone)]
pub struct DnsPeers {
    host: String,
    port: u16,
}

impl DnsPeers {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

#[async_trait]
impl PeerDiscovery for DnsPeers {
    async fn peers(&self) -> Result<Vec<String>> {
        let target = format!("{}:{}", self.host, self.port);
        let addrs = tokio::net::lookup_host(&target).await.map_err(|error| {
            LayercastError::Discovery(format!("failed to resolve {}: {}", target, error))
        })?;

        let ips: BTreeSet<String> = addrs.map(|addr| addr.ip().to_string()).collect();
        tracing::debug!("Resolved {} peers from {}", ips.len(), self.host);
        Ok(ips.into_iter().collect())
    }
}

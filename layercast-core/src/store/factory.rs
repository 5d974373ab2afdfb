use super::{DynPresenceStore, memory::MemoryPresenceStore, redis::RedisPresenceStore};
use crate::{LayercastError, Result};
use std::sync::Arc;

#[derive(Debug, Clone, Default)]
pub struct StoreBuilder {
    backend: Option<String>,
    redis_url: Option<String>,
}

impl StoreBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = Some(backend.into());
        self
    }

    pub fn redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = Some(url.into());
        self
    }

    fn resolve_backend(&self) -> Result<String> {
        let backend = self
            .backend
            .as_deref()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        if backend.is_empty() {
            return Err(LayercastError::Config(
                "store backend cannot be empty".to_string(),
            ));
        }

        Ok(backend)
    }

    pub async fn build(&self) -> Result<DynPresenceStore> {
        let backend = self.resolve_backend()?;

        match backend.as_str() {
            "redis" => {
                let url = self.redis_url.as_deref().unwrap_or_default().trim();
                if url.is_empty() {
                    return Err(LayercastError::Config(
                        "redis url is required for redis backend".to_string(),
                    ));
                }

                let store = RedisPresenceStore::new(url).await?;
                Ok(Arc::new(store))
            }
            "memory" => {
                tracing::warn!("Using in-memory presence store; records are not shared with peers");
                Ok(Arc::new(MemoryPresenceStore::new()))
            }
            other => Err(LayercastError::Config(format!(
                "unsupported store backend: {}",
                other
            ))),
        }
    }
}

use super::{PresenceStore, ScanPage};
use crate::{LayercastError, Result};
use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use std::time::Duration;

/// Presence store backed by a Redis server.
///
/// Uses a `ConnectionManager`, which multiplexes commands over one connection
/// and reconnects on failure. Cloning the manager per command is cheap.
#[derive(Clone)]
pub struct RedisPresenceStore {
    conn: ConnectionManager,
}

impl RedisPresenceStore {
    pub async fn new(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(|error| {
            LayercastError::Config(format!("invalid redis url '{}': {}", url, error))
        })?;

        let conn = ConnectionManager::new(client).await.map_err(|error| {
            LayercastError::Store(format!("redis connection to {} failed: {}", url, error))
        })?;

        tracing::info!("Connected presence store to redis at {}", url);
        Ok(Self { conn })
    }
}

/// Redis TTLs are whole seconds; round up so a record never lives shorter than asked.
fn ttl_seconds(ttl: Duration) -> u64 {
    let mut secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs += 1;
    }
    secs.max(1)
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl_seconds(ttl)).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(key).await?;
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let secs = i64::try_from(ttl_seconds(ttl)).map_err(|_| {
            LayercastError::InvalidRequest(format!("ttl {:?} is too large", ttl))
        })?;
        let updated: bool = conn.expire(key, secs).await?;
        Ok(updated)
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage> {
        let mut conn = self.conn.clone();
        let (cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(pattern)
            .arg("COUNT")
            .arg(count.max(1))
            .query_async(&mut conn)
            .await?;
        Ok(ScanPage { cursor, keys })
    }
}

use super::{PresenceStore, ScanPage};
use crate::{LayercastError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

impl MemoryEntry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

/// Open scan cursors, each mapped to the last key its previous page returned.
#[derive(Debug, Default)]
struct ScanCursors {
    next_id: u64,
    resume_after: HashMap<u64, String>,
}

impl ScanCursors {
    fn open(&mut self, last_key: String) -> u64 {
        self.next_id = self.next_id.wrapping_add(1).max(1);
        self.resume_after.insert(self.next_id, last_key);
        self.next_id
    }
}

/// In-process presence store with per-key TTLs.
///
/// Expired entries are invisible to every call and are purged on the next
/// write. Deadlines use `tokio::time::Instant`, so paused-clock tests can
/// advance past a TTL without sleeping.
///
/// Scan cursors resume after the last key handed out, so keys that stay live
/// for a whole scan are returned even when other keys come and go between
/// pages. A cursor is consumed by the page that uses it.
#[derive(Debug, Default)]
pub struct MemoryPresenceStore {
    entries: RwLock<BTreeMap<String, MemoryEntry>>,
    cursors: Mutex<ScanCursors>,
}

impl MemoryPresenceStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live entries.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.entries.read().await;
        entries.values().filter(|entry| entry.is_live(now)).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn purge_expired(entries: &mut BTreeMap<String, MemoryEntry>, now: Instant) {
        entries.retain(|_, entry| entry.is_live(now));
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        Self::purge_expired(&mut entries, now);
        entries.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at: now + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let entries = self.entries.read().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.is_live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.remove(key);
        Ok(())
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let now = Instant::now();
        let mut entries = self.entries.write().await;
        Self::purge_expired(&mut entries, now);
        match entries.get_mut(key) {
            Some(entry) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn scan(&self, cursor: u64, pattern: &str, count: usize) -> Result<ScanPage> {
        let resume_after = if cursor == 0 {
            None
        } else {
            let mut cursors = self.cursors.lock().await;
            let last_key = cursors.resume_after.remove(&cursor).ok_or_else(|| {
                LayercastError::InvalidRequest(format!("unknown scan cursor {}", cursor))
            })?;
            Some(last_key)
        };

        let now = Instant::now();
        let entries = self.entries.read().await;
        let lower = match resume_after.as_deref() {
            Some(last_key) => Bound::Excluded(last_key),
            None => Bound::Unbounded,
        };

        let mut matching = entries
            .range::<str, _>((lower, Bound::Unbounded))
            .filter(|(key, entry)| entry.is_live(now) && glob_match(pattern, key))
            .map(|(key, _)| key.clone());

        let keys: Vec<String> = matching.by_ref().take(count.max(1)).collect();
        let next_cursor = match (keys.last(), matching.next()) {
            (Some(last_key), Some(_)) => self.cursors.lock().await.open(last_key.clone()),
            _ => 0,
        };

        Ok(ScanPage {
            cursor: next_cursor,
            keys,
        })
    }
}

/// Redis-style glob with `*` and `?` wildcards.
pub(crate) fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    let mut star: Option<usize> = None;
    let mut star_text = 0usize;

    while t < text.len() {
        if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            star_text = t;
            p += 1;
        } else if let Some(star_pos) = star {
            p = star_pos + 1;
            star_text += 1;
            t = star_text;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Shared fast key-value store used for rate-limit counters, the detection
/// advisory lock and short-TTL caches. The interface mirrors the INCR /
/// EXPIRE / SETNX primitives of a networked store so a remote backend can
/// replace this one without touching callers.
pub struct KvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

struct Entry {
    value: EntryValue,
    expires_at: Option<Instant>,
}

enum EntryValue {
    Counter(u64),
    Text(String),
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }

    fn ttl_remaining(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

impl Default for KvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KvStore {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Increment the counter at `key`, creating it with `ttl` when absent.
    /// Returns the new count and the window remainder.
    pub async fn incr_with_ttl(&self, key: &str, ttl: Duration) -> (u64, Duration) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let entry = entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: EntryValue::Counter(0),
            expires_at: Some(now + ttl),
        });
        if entry.expired(now) {
            entry.value = EntryValue::Counter(0);
            entry.expires_at = Some(now + ttl);
        }
        let count = match &mut entry.value {
            EntryValue::Counter(c) => {
                *c += 1;
                *c
            }
            EntryValue::Text(_) => {
                entry.value = EntryValue::Counter(1);
                entry.expires_at = Some(now + ttl);
                1
            }
        };
        let remaining = entry.ttl_remaining(now).unwrap_or(ttl);
        (count, remaining)
    }

    pub async fn set_with_ttl(&self, key: &str, value: impl Into<String>, ttl: Duration) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: EntryValue::Text(value.into()),
                expires_at: Some(Instant::now() + ttl),
            },
        );
    }

    pub async fn get(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if !entry.expired(now) => match &entry.value {
                EntryValue::Text(s) => Some(s.clone()),
                EntryValue::Counter(c) => Some(c.to_string()),
            },
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    pub async fn delete(&self, key: &str) {
        self.entries.lock().await.remove(key);
    }

    /// Set-if-absent with TTL: the advisory-lock primitive. Returns true when
    /// this caller now holds the lock.
    pub async fn try_acquire(&self, key: &str, owner: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if !entry.expired(now) => false,
            _ => {
                entries.insert(
                    key.to_string(),
                    Entry {
                        value: EntryValue::Text(owner.to_string()),
                        expires_at: Some(now + ttl),
                    },
                );
                true
            }
        }
    }

    pub async fn release(&self, key: &str, owner: &str) {
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get(key) {
            if matches!(&entry.value, EntryValue::Text(current) if current == owner) {
                entries.remove(key);
            }
        }
    }

    /// Drop every expired entry; called opportunistically by housekeeping.
    pub async fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|_, entry| !entry.expired(now));
        before - entries.len()
    }
}

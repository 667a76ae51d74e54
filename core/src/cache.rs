//! In-memory response cache with TTL and prefix invalidation.
//!
//! Keys are `endpoint_key|fingerprint`, kept in a `BTreeMap` so every entry of
//! a resource family sits in one contiguous range. Expiry is checked lazily on
//! read; `purge_expired` and the optional sweeper only reclaim memory.
//! Entries are re-derivable copies of backend state, so concurrent writers
//! simply overwrite each other. Every invalidation records a stamp; a value
//! fetched before an invalidation of its prefix is refused by
//! `put_if_unchanged`, so a slow read cannot re-insert pre-mutation data.

use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::{Arc, Weak};
use std::time::Duration;

use bytes::Bytes;
use parking_lot::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: String,
    pub value: Bytes,
    pub expires_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

#[derive(Debug, Default)]
struct CacheInner {
    entries: BTreeMap<String, CacheEntry>,
    /// Bumped by every invalidation.
    stamp: u64,
    cleared_at: u64,
    /// Stamp of the latest invalidation per prefix.
    invalidated: HashMap<String, u64>,
}

impl CacheInner {
    fn bump(&mut self) -> u64 {
        self.stamp += 1;
        self.stamp
    }

    fn invalidated_since(&self, key: &str, since: u64) -> bool {
        self.cleared_at > since
            || self
                .invalidated
                .iter()
                .any(|(prefix, &at)| at > since && key.starts_with(prefix.as_str()))
    }
}

#[derive(Debug, Default)]
pub struct CacheStore {
    inner: RwLock<CacheInner>,
}

impl CacheStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached value for `key`, or `None` if absent or expired.
    pub fn get(&self, key: &str) -> Option<Bytes> {
        let now = Instant::now();
        {
            let inner = self.inner.read();
            match inner.entries.get(key) {
                None => return None,
                Some(entry) if !entry.is_expired(now) => return Some(entry.value.clone()),
                Some(_) => {}
            }
        }

        // Re-check under the write lock: a writer may have refreshed it.
        let mut inner = self.inner.write();
        if inner.entries.get(key).is_some_and(|entry| entry.is_expired(now)) {
            inner.entries.remove(key);
        }
        None
    }

    pub fn put(&self, key: impl Into<String>, value: Bytes, ttl: Duration) {
        let key = key.into();
        let entry = CacheEntry {
            key: key.clone(),
            value,
            expires_at: Instant::now() + ttl,
        };
        self.inner.write().entries.insert(key, entry);
    }

    /// Current invalidation stamp. Take it before fetching a value that will
    /// be stored with `put_if_unchanged`.
    pub fn stamp(&self) -> u64 {
        self.inner.read().stamp
    }

    /// `put`, unless an invalidation covering `key` ran after `since`.
    /// Returns whether the value was stored.
    pub fn put_if_unchanged(&self, key: impl Into<String>, value: Bytes, ttl: Duration, since: u64) -> bool {
        let key = key.into();
        let mut inner = self.inner.write();
        if inner.invalidated_since(&key, since) {
            return false;
        }
        let entry = CacheEntry {
            key: key.clone(),
            value,
            expires_at: Instant::now() + ttl,
        };
        inner.entries.insert(key, entry);
        true
    }

    /// Remove every entry whose key starts with `prefix`; returns the count.
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.write();
        let stamp = inner.bump();
        inner.invalidated.insert(prefix.to_string(), stamp);
        let doomed: Vec<String> = inner
            .entries
            .range::<str, _>((Bound::Included(prefix), Bound::Unbounded))
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect();
        for key in &doomed {
            inner.entries.remove(key);
        }
        doomed.len()
    }

    /// Drop entries whose TTL has elapsed; returns the count.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut inner = self.inner.write();
        let before = inner.entries.len();
        inner.entries.retain(|_, entry| !entry.is_expired(now));
        before - inner.entries.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.write();
        let stamp = inner.bump();
        inner.cleared_at = stamp;
        // Older per-prefix stamps are covered by `cleared_at`.
        inner.invalidated.clear();
        inner.entries.clear();
    }

    /// Number of stored entries, including expired ones not yet purged.
    pub fn len(&self) -> usize {
        self.inner.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().entries.is_empty()
    }

    /// Periodically purge expired entries until the store is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store: Weak<CacheStore> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(store) = store.upgrade() else {
                    break;
                };
                let purged = store.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "cache sweep");
                }
            }
        })
    }
}

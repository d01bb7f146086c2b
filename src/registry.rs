/*
 * Copyright (C) 2025 Pedro Henrique / phkaiser13
 *
 * File: src/registry.rs
 *
 * The registry of tracked HPAs, shared between the discovery watcher (the
 * only writer) and the reconciliation loop (which only reads snapshots).
 *
 * SPDX-License-Identifier: Apache-2.0
 */

use crate::hpa::TrackedHpa;
use crate::metrics::TRACKED_HPAS;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Cheaply clonable handle to the shared map of tracked HPAs, keyed by
/// `namespace/name`.
///
/// Every write happens under the write lock, so a reader never observes a
/// partially written entry. `snapshot` copies the entries out and releases
/// the lock before the caller iterates.
#[derive(Clone, Default)]
pub struct HpaRegistry {
    inner: Arc<RwLock<HashMap<String, TrackedHpa>>>,
}

impl HpaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces the entry for `hpa.key()`, returning the replaced one.
    pub async fn put(&self, hpa: TrackedHpa) -> Option<TrackedHpa> {
        let mut map = self.inner.write().await;
        let previous = map.insert(hpa.key(), hpa);
        TRACKED_HPAS.set(map.len() as i64);
        previous
    }

    /// Removes `key`, returning the entry that was tracked, if any.
    pub async fn remove(&self, key: &str) -> Option<TrackedHpa> {
        let mut map = self.inner.write().await;
        let removed = map.remove(key);
        TRACKED_HPAS.set(map.len() as i64);
        removed
    }

    /// Point-in-time copy of all entries, in no particular order.
    pub async fn snapshot(&self) -> Vec<TrackedHpa> {
        self.inner.read().await.values().cloned().collect()
    }

    #[cfg(test)]
    pub async fn get(&self, key: &str) -> Option<TrackedHpa> {
        self.inner.read().await.get(key).cloned()
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }
}

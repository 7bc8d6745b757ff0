//! Client-side merge of event deliveries and polled snapshots.

use std::collections::HashMap;
use std::hash::Hash;

use serde::Serialize;

/// An entity snapshot that can be ordered by version.
pub trait Versioned: Clone {
    type Key: Eq + Hash + Clone;

    fn key(&self) -> Self::Key;
    fn version(&self) -> u64;
}

/// A consistent poll of one registry.
///
/// `watermark` is the bus revision observed while the registry lock was held:
/// every mutation of this registry at or below it is reflected in `items`.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot<T> {
    pub items: Vec<T>,
    pub watermark: u64,
}

/// Last-writer-wins view keyed by entity id.
///
/// Duplicate or stale deliveries are ignored by version comparison;
/// removals leave a tombstone so a late upsert cannot resurrect an entity.
#[derive(Debug, Clone)]
pub struct ReconcilingView<T: Versioned> {
    items: HashMap<T::Key, T>,
    tombstones: HashMap<T::Key, u64>,
    watermark: u64,
}

impl<T: Versioned> Default for ReconcilingView<T> {
    fn default() -> Self {
        Self {
            items: HashMap::new(),
            tombstones: HashMap::new(),
            watermark: 0,
        }
    }
}

impl<T: Versioned> ReconcilingView<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold an upsert event. Returns whether the view changed.
    pub fn apply_upsert(&mut self, item: T) -> bool {
        let key = item.key();
        let version = item.version();
        if self.tombstones.get(&key).is_some_and(|&dead| dead >= version) {
            return false;
        }
        if self.items.get(&key).is_some_and(|cur| cur.version() >= version) {
            return false;
        }
        self.tombstones.remove(&key);
        self.items.insert(key, item);
        true
    }

    /// Fold a removal event committed at `revision`.
    pub fn apply_removal(&mut self, key: T::Key, revision: u64) -> bool {
        if self.items.get(&key).is_some_and(|cur| cur.version() > revision) {
            return false;
        }
        let removed = self.items.remove(&key).is_some();
        let tomb = self.tombstones.entry(key).or_insert(revision);
        *tomb = (*tomb).max(revision);
        removed
    }

    /// Merge a polled snapshot.
    ///
    /// Local entries absent from the poll are dropped when their version is
    /// at or below the watermark. Entries newer than the watermark came from
    /// events the poll could not have seen and are kept.
    pub fn reconcile(&mut self, snapshot: Snapshot<T>) {
        let mut polled = HashMap::with_capacity(snapshot.items.len());
        for item in snapshot.items {
            polled.insert(item.key(), ());
            self.apply_upsert(item);
        }

        let watermark = snapshot.watermark;
        let stale: Vec<T::Key> = self
            .items
            .iter()
            .filter(|(k, v)| !polled.contains_key(*k) && v.version() <= watermark)
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.items.remove(&key);
        }

        // Any later poll already excludes what these guarded.
        self.tombstones.retain(|_, dead| *dead > watermark);
        self.watermark = self.watermark.max(watermark);
    }

    pub fn get(&self, key: &T::Key) -> Option<&T> {
        self.items.get(key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn watermark(&self) -> u64 {
        self.watermark
    }

    /// Current items, oldest change first.
    pub fn items(&self) -> Vec<T> {
        let mut items: Vec<T> = self.items.values().cloned().collect();
        items.sort_by_key(|i| i.version());
        items
    }
}

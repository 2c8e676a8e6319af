//! driftlog store: process-lifetime snapshot cache keyed by resource identity.
//!
//! Backed by a `DashMap`, so reconciles for distinct resources rarely contend on
//! the same lock. Entries are never evicted.
//!
//! Correctness of change detection depends on the caller running at most one
//! reconcile per identity at a time; the cache itself only guarantees that each
//! individual `load`/`store`/`load_or_store` is atomic.

#![forbid(unsafe_code)]

use std::hash::BuildHasherDefault;
use std::sync::Arc;

use dashmap::DashMap;
use driftlog_core::{ResourceIdentity, ResourceSnapshot};
use metrics::increment_gauge;
use rustc_hash::FxHasher;
use tracing::trace;

type FxBuild = BuildHasherDefault<FxHasher>;

#[derive(Default)]
pub struct StateCache {
    map: DashMap<ResourceIdentity, Arc<ResourceSnapshot>, FxBuild>,
}

impl StateCache {
    pub fn new() -> Self { Self::default() }

    pub fn load(&self, id: &ResourceIdentity) -> Option<Arc<ResourceSnapshot>> {
        self.map.get(id).map(|e| Arc::clone(e.value()))
    }

    /// Insert or overwrite the snapshot for `id`.
    pub fn store(&self, id: ResourceIdentity, snap: ResourceSnapshot) {
        trace!(%id, "cache store");
        if self.map.insert(id, Arc::new(snap)).is_none() {
            increment_gauge!("state_cache_entries", 1.0);
        }
    }

    /// Return the existing snapshot (`loaded = true`), or store `snap` and return
    /// it (`loaded = false`).
    pub fn load_or_store(&self, id: ResourceIdentity, snap: ResourceSnapshot) -> (Arc<ResourceSnapshot>, bool) {
        let mut inserted = false;
        let current = Arc::clone(
            self.map
                .entry(id)
                .or_insert_with(|| {
                    inserted = true;
                    Arc::new(snap)
                })
                .value(),
        );
        if inserted {
            increment_gauge!("state_cache_entries", 1.0);
        }
        (current, !inserted)
    }

    pub fn len(&self) -> usize { self.map.len() }

    pub fn is_empty(&self) -> bool { self.map.is_empty() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snap(v: i64) -> ResourceSnapshot {
        ResourceSnapshot::observe(&json!({ "spec": { "v": v } }))
    }

    #[test]
    fn store_overwrites_single_entry() {
        let cache = StateCache::new();
        let id = ResourceIdentity::new("ns", "a", "Kind");
        cache.store(id.clone(), snap(1));
        cache.store(id.clone(), snap(2));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.load(&id).unwrap().spec(), &json!({ "v": 2 }));
    }

    #[test]
    fn load_or_store_keeps_first_value() {
        let cache = StateCache::new();
        let id = ResourceIdentity::new("ns", "a", "Kind");
        let (first, loaded) = cache.load_or_store(id.clone(), snap(1));
        assert!(!loaded);
        assert_eq!(first.spec(), &json!({ "v": 1 }));
        let (again, loaded) = cache.load_or_store(id.clone(), snap(9));
        assert!(loaded);
        assert_eq!(again.spec(), &json!({ "v": 1 }));
    }

    #[test]
    fn baseline_inserts_are_counted() {
        let cache = StateCache::new();
        for i in 0..5 {
            cache.load_or_store(ResourceIdentity::new("ns", format!("obj-{}", i), "Kind"), snap(i));
        }
        // repeat sightings do not add entries
        cache.load_or_store(ResourceIdentity::new("ns", "obj-0", "Kind"), snap(7));
        assert_eq!(cache.len(), 5);
        cache.store(ResourceIdentity::new("ns", "obj-9", "Kind"), snap(9));
        assert_eq!(cache.len(), 6);
    }

    #[test]
    fn kinds_do_not_collide() {
        let cache = StateCache::new();
        cache.store(ResourceIdentity::new("ns", "a", "Es"), snap(1));
        cache.store(ResourceIdentity::new("ns", "a", "Redis"), snap(2));
        assert_eq!(cache.len(), 2);
    }
}

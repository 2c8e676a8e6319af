//! Registry of discovered kinds, keyed by singular resource name.
//!
//! A registry value is immutable once published. Re-discovery clones the current
//! registry, merges new descriptors into the clone and swaps it in, so readers
//! always see a complete pass.
//!
//! Discovery only produces top-level kinds. Child kinds are attached by embedders
//! through [`SharedRegistry::update`] and [`TypeRegistry::attach_child`] before the
//! controllers are built; `driftlogd` itself discovers once at startup and never
//! attaches children.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use driftlog_core::TypeDescriptor;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeRegistry {
    by_singular: BTreeMap<String, TypeDescriptor>,
}

impl TypeRegistry {
    pub fn new() -> Self { Self::default() }

    /// Merge a freshly discovered descriptor.
    ///
    /// Identity fields (group/version/kind/names/scope) are overwritten. Children
    /// already attached are preserved. The status mapping is only replaced when the
    /// new one is non-empty.
    pub fn merge(&mut self, incoming: TypeDescriptor) {
        match self.by_singular.get_mut(&incoming.singular) {
            Some(existing) => {
                debug!(singular = %incoming.singular, version = %incoming.version, "registry: update");
                existing.group = incoming.group;
                existing.version = incoming.version;
                existing.kind = incoming.kind;
                existing.list_kind = incoming.list_kind;
                existing.plural = incoming.plural;
                existing.namespaced = incoming.namespaced;
                if !incoming.status_mapping.is_empty() {
                    existing.status_mapping = incoming.status_mapping;
                }
                for (k, child) in incoming.children {
                    existing.children.entry(k).or_insert(child);
                }
            }
            None => {
                debug!(singular = %incoming.singular, version = %incoming.version, "registry: insert");
                self.by_singular.insert(incoming.singular.clone(), incoming);
            }
        }
    }

    /// Attach (or replace) a child kind under `parent`. Returns false when the
    /// parent is unknown.
    pub fn attach_child(&mut self, parent: &str, child: TypeDescriptor) -> bool {
        match self.by_singular.get_mut(parent) {
            Some(p) => {
                p.children.insert(child.singular.clone(), child);
                true
            }
            None => false,
        }
    }

    pub fn get(&self, singular: &str) -> Option<&TypeDescriptor> { self.by_singular.get(singular) }

    pub fn iter(&self) -> impl Iterator<Item = &TypeDescriptor> { self.by_singular.values() }

    pub fn len(&self) -> usize { self.by_singular.len() }

    pub fn is_empty(&self) -> bool { self.by_singular.is_empty() }
}

/// Handle for readers to access the current registry and for discovery to swap
/// in a new one.
#[derive(Clone)]
pub struct SharedRegistry {
    inner: Arc<ArcSwap<TypeRegistry>>,
}

impl Default for SharedRegistry {
    fn default() -> Self { Self::new(TypeRegistry::default()) }
}

impl SharedRegistry {
    pub fn new(initial: TypeRegistry) -> Self {
        Self { inner: Arc::new(ArcSwap::from_pointee(initial)) }
    }

    pub fn current(&self) -> Arc<TypeRegistry> { self.inner.load_full() }

    pub fn publish(&self, next: TypeRegistry) { self.inner.store(Arc::new(next)); }

    /// Clone the current registry, let `f` edit the copy, then publish it.
    /// Discovery is the only writer; concurrent `update` calls are not merged.
    pub fn update<F: FnOnce(&mut TypeRegistry)>(&self, f: F) {
        let mut next = TypeRegistry::clone(&self.inner.load());
        f(&mut next);
        self.publish(next);
    }
}

use std::future::Future;
use std::hash::BuildHasherDefault;
use std::sync::Arc;

use dashmap::DashMap;
use driftlog_core::ResourceIdentity;
use rustc_hash::FxHasher;
use tokio::sync::Mutex as AsyncMutex;

type Slot = Arc<AsyncMutex<()>>;
type Slots = DashMap<ResourceIdentity, Slot, BuildHasherDefault<FxHasher>>;

/// Keyed lock: futures run through the same identity execute one at a time, in
/// arrival order; different identities run in parallel. Idle keys are dropped,
/// including when a caller is cancelled mid-flight.
#[derive(Default)]
pub struct SingleFlight {
    slots: Slots,
}

/// Releases the slot entry once no other caller holds a handle to it.
struct SlotRelease<'a> {
    slots: &'a Slots,
    id: &'a ResourceIdentity,
    slot: Slot,
}

impl Drop for SlotRelease<'_> {
    fn drop(&mut self) {
        // map + this handle; clones only happen under the entry's shard lock
        self.slots.remove_if(self.id, |_, slot| Arc::strong_count(slot) == 2);
    }
}

impl SingleFlight {
    pub fn new() -> Self { Self::default() }

    pub async fn run<F, T>(&self, id: &ResourceIdentity, fut: F) -> T
    where
        F: Future<Output = T>,
    {
        let slot = Arc::clone(self.slots.entry(id.clone()).or_default().value());
        let release = SlotRelease { slots: &self.slots, id, slot };
        let _held = release.slot.lock().await;
        fut.await
    }

    /// Number of identities with an in-flight or queued invocation.
    pub fn active(&self) -> usize { self.slots.len() }
}

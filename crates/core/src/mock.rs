//! In-memory `ClusterApi` used by tests and dry runs.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

use crate::{ClusterApi, ClusterError, ResourceIdentity, TypeDescriptor};

/// Simple in-memory cluster. Objects are keyed by identity; CRDs are returned for
/// any selector present in `crds`.
#[derive(Default)]
pub struct MockCluster {
    objects: Mutex<HashMap<ResourceIdentity, serde_json::Value>>,
    crds: Mutex<HashMap<String, Vec<CustomResourceDefinition>>>,
    fail_next: AtomicUsize,
    gets: AtomicUsize,
}

impl MockCluster {
    pub fn new() -> Self { Self::default() }

    pub fn put(&self, id: &ResourceIdentity, doc: serde_json::Value) {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).insert(id.clone(), doc);
    }

    pub fn remove(&self, id: &ResourceIdentity) {
        self.objects.lock().unwrap_or_else(|e| e.into_inner()).remove(id);
    }

    pub fn set_crds(&self, selector: &str, crds: Vec<CustomResourceDefinition>) {
        self.crds.lock().unwrap_or_else(|e| e.into_inner()).insert(selector.to_string(), crds);
    }

    /// Make the next `n` calls fail with a transient error.
    pub fn fail_next(&self, n: usize) { self.fail_next.store(n, Ordering::SeqCst); }

    pub fn get_calls(&self) -> usize { self.gets.load(Ordering::SeqCst) }

    fn take_failure(&self) -> Option<ClusterError> {
        let res = self.fail_next.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        res.ok().map(|_| ClusterError::transient("injected failure"))
    }
}

#[async_trait::async_trait]
impl ClusterApi for MockCluster {
    async fn list_crds(&self, selector: &str) -> Result<Vec<CustomResourceDefinition>, ClusterError> {
        if let Some(e) = self.take_failure() { return Err(e); }
        let crds = self.crds.lock().unwrap_or_else(|e| e.into_inner());
        Ok(crds.get(selector).cloned().unwrap_or_default())
    }

    async fn get_object(
        &self,
        ty: &TypeDescriptor,
        namespace: &str,
        name: &str,
    ) -> Result<serde_json::Value, ClusterError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        // let concurrent callers interleave the way a real network round-trip would
        tokio::task::yield_now().await;
        if let Some(e) = self.take_failure() { return Err(e); }
        let id = ty.identity(namespace, name);
        let objects = self.objects.lock().unwrap_or_else(|e| e.into_inner());
        objects.get(&id).cloned().ok_or_else(|| ClusterError::NotFound(id.to_string()))
    }
}

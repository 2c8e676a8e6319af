//! One discovery pass: list labelled CRDs, turn each into a descriptor and publish
//! the merged registry.

use anyhow::{Context, Result};
use metrics::counter;
use tracing::{info, warn};

use driftlog_core::ClusterApi;
use driftlog_schema::{descriptor_from_crd, SharedRegistry, TypeRegistry};

/// Run a discovery pass and return how many descriptors were merged.
///
/// The new registry is built on a copy of the current one and published only after
/// every CRD was processed; on a listing error nothing is published.
pub async fn discover(
    cluster: &dyn ClusterApi,
    selector: &str,
    status_prefix: &str,
    registry: &SharedRegistry,
) -> Result<usize> {
    let crds = cluster
        .list_crds(selector)
        .await
        .with_context(|| format!("listing CRDs with selector {:?}", selector))?;
    if crds.is_empty() {
        warn!(selector = %selector, "no CRDs matched");
    }

    let mut next = TypeRegistry::clone(&registry.current());
    let mut merged = 0usize;
    for crd in &crds {
        let Some(desc) = descriptor_from_crd(crd, status_prefix) else { continue };
        info!(kind = %desc.kind, gvk = %desc.gvk_key(), singular = %desc.singular, mappings = desc.status_mapping.len(), "discovered");
        next.merge(desc);
        merged += 1;
    }
    counter!("discovery_crds", merged as u64);
    registry.publish(next);
    Ok(merged)
}

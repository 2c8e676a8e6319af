//! driftlog schema: turn CustomResourceDefinitions into type descriptors and keep
//! them in a registry keyed by singular name.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use driftlog_core::TypeDescriptor;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1 as apiextv1;
use tracing::warn;

pub mod registry;

pub use registry::{SharedRegistry, TypeRegistry};

/// Label selector used when none is configured.
pub const DEFAULT_CRD_SELECTOR: &str = "MiddlewareCluster";
/// Annotation prefix marking status-mapping entries on a CRD.
pub const DEFAULT_STATUS_PREFIX: &str = "harmonycloud";

/// Build a descriptor from one CRD.
///
/// The version is always the last one declared in `spec.versions`, whether or not
/// it is the storage or served version. Returns `None` when the CRD declares no
/// versions at all.
pub fn descriptor_from_crd(crd: &apiextv1::CustomResourceDefinition, status_prefix: &str) -> Option<TypeDescriptor> {
    let spec = &crd.spec;
    let crd_name = crd.metadata.name.as_deref().unwrap_or("");
    let Some(version) = spec.versions.last() else {
        warn!(crd = %crd_name, "CRD declares no versions; skipping");
        return None;
    };
    let names = &spec.names;
    let kind = names.kind.clone();
    let list_kind = names.list_kind.clone().unwrap_or_else(|| format!("{}List", kind));
    let singular = names
        .singular
        .clone()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| kind.to_lowercase());

    Some(TypeDescriptor {
        group: spec.group.clone(),
        version: version.name.clone(),
        kind,
        list_kind,
        plural: names.plural.clone(),
        singular,
        namespaced: spec.scope != "Cluster",
        status_mapping: status_mapping(crd.metadata.annotations.as_ref(), status_prefix),
        children: BTreeMap::new(),
    })
}

/// Keep only annotations whose key starts with `prefix`.
pub fn status_mapping(annotations: Option<&BTreeMap<String, String>>, prefix: &str) -> BTreeMap<String, String> {
    annotations
        .map(|a| {
            a.iter()
                .filter(|(k, _)| k.starts_with(prefix))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        })
        .unwrap_or_default()
}

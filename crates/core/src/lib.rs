//! driftlog core types: resource identities, type descriptors, snapshots and the
//! cluster capability the audit engine consumes.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use serde::{Deserialize, Serialize};

pub mod mock;
pub mod snapshot;

pub use snapshot::{ResourceSnapshot, SerializationError};

pub mod prelude {
    pub use super::{ClusterApi, ClusterError, ResourceIdentity, TypeDescriptor};
    pub use super::snapshot::{ResourceSnapshot, SerializationError};
}

/// (namespace, name, kind) of one watched resource instance.
/// Cluster-scoped resources carry an empty namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceIdentity {
    pub namespace: String,
    pub name: String,
    pub kind: String,
}

impl ResourceIdentity {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), name: name.into(), kind: kind.into() }
    }

    /// `namespace/name`, the form used in audit headers.
    pub fn namespaced_name(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }
}

impl fmt::Display for ResourceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.kind, self.namespace, self.name)
    }
}

/// Description of one dynamically discovered kind.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeDescriptor {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub list_kind: String,
    pub plural: String,
    pub singular: String,
    pub namespaced: bool,
    /// Annotation key -> status field path, taken from vendor-prefixed CRD annotations.
    pub status_mapping: BTreeMap<String, String>,
    /// Child kinds keyed by singular name.
    pub children: BTreeMap<String, TypeDescriptor>,
}

impl TypeDescriptor {
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn gvk_key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn identity(&self, namespace: impl Into<String>, name: impl Into<String>) -> ResourceIdentity {
        ResourceIdentity::new(namespace, name, self.kind.clone())
    }
}

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures reported by the cluster control-plane client.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("cluster api request failed")]
    Transient(#[source] BoxError),
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool { matches!(self, ClusterError::NotFound(_)) }

    pub fn transient<E: Into<BoxError>>(e: E) -> Self { ClusterError::Transient(e.into()) }
}

/// Capabilities consumed from the cluster control plane.
#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// List CRDs matching a label selector.
    async fn list_crds(&self, selector: &str) -> Result<Vec<CustomResourceDefinition>, ClusterError>;

    /// Fetch one object of the given kind as a generic JSON document.
    async fn get_object(
        &self,
        ty: &TypeDescriptor,
        namespace: &str,
        name: &str,
    ) -> Result<serde_json::Value, ClusterError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gvk_key_handles_core_group() {
        let mut d = TypeDescriptor { version: "v1".into(), kind: "ConfigMap".into(), ..Default::default() };
        assert_eq!(d.gvk_key(), "v1/ConfigMap");
        assert_eq!(d.api_version(), "v1");
        d.group = "es.example.io".into();
        assert_eq!(d.gvk_key(), "es.example.io/v1/ConfigMap");
        assert_eq!(d.api_version(), "es.example.io/v1");
    }

    #[test]
    fn namespaced_name_keeps_empty_namespace() {
        let id = ResourceIdentity::new("", "node-a", "Thing");
        assert_eq!(id.namespaced_name(), "/node-a");
    }
}

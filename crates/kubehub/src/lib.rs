//! driftlog kubehub: kube-rs backed cluster access, CRD discovery, controller
//! wiring and the node capacity override.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, ListParams},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    Client,
};
use tracing::debug;

use driftlog_core::{ClusterApi, ClusterError, TypeDescriptor};

pub mod controller;
pub mod discovery;
pub mod node;

pub use controller::{plan_controllers, ControllerFactory, ControllerPlan, ControllerSettings};
pub use discovery::discover;

pub async fn get_kube_client() -> Result<Client> {
    Client::try_default().await.context("building kube client from environment")
}

/// `ApiResource` for a discovered kind; plural comes from the CRD, not from
/// guessing.
pub fn api_resource(ty: &TypeDescriptor) -> ApiResource {
    let gvk = GroupVersionKind::gvk(&ty.group, &ty.version, &ty.kind);
    ApiResource::from_gvk_with_plural(&gvk, &ty.plural)
}

/// [`ClusterApi`] over a live kube client.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
}

impl KubeCluster {
    pub fn new(client: Client) -> Self { Self { client } }

    pub fn client(&self) -> &Client { &self.client }

    fn dynamic_api(&self, ty: &TypeDescriptor, namespace: &str) -> Api<DynamicObject> {
        let ar = api_resource(ty);
        if ty.namespaced && !namespace.is_empty() {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        }
    }
}

#[async_trait::async_trait]
impl ClusterApi for KubeCluster {
    async fn list_crds(&self, selector: &str) -> Result<Vec<CustomResourceDefinition>, ClusterError> {
        let api: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let lp = ListParams::default().labels(selector);
        let list = api.list(&lp).await.map_err(ClusterError::transient)?;
        debug!(selector = %selector, count = list.items.len(), "listed CRDs");
        Ok(list.items)
    }

    async fn get_object(
        &self,
        ty: &TypeDescriptor,
        namespace: &str,
        name: &str,
    ) -> Result<serde_json::Value, ClusterError> {
        let api = self.dynamic_api(ty, namespace);
        match api.get_opt(name).await.map_err(ClusterError::transient)? {
            Some(obj) => serde_json::to_value(&obj).map_err(ClusterError::transient),
            None => Err(ClusterError::NotFound(format!("{}/{}/{}", ty.kind, namespace, name))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn api_resource_uses_declared_plural() {
        let ty = TypeDescriptor {
            group: "es.example.io".into(),
            version: "v1beta1".into(),
            kind: "EsCluster".into(),
            plural: "esclusterz".into(),
            ..Default::default()
        };
        let ar = api_resource(&ty);
        assert_eq!(ar.api_version, "es.example.io/v1beta1");
        assert_eq!(ar.plural, "esclusterz");
        assert_eq!(ar.kind, "EsCluster");
    }
}

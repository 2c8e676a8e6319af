#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use driftlog_core::mock::MockCluster;
use driftlog_kubehub::{discover, plan_controllers};
use driftlog_schema::SharedRegistry;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::{
    CustomResourceDefinition, CustomResourceDefinitionNames, CustomResourceDefinitionSpec,
    CustomResourceDefinitionVersion,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn crd(kind: &str, versions: &[&str], annotations: &[(&str, &str)]) -> CustomResourceDefinition {
    let plural = format!("{}s", kind.to_lowercase());
    let annotations: BTreeMap<String, String> =
        annotations.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
    CustomResourceDefinition {
        metadata: ObjectMeta {
            name: Some(format!("{}.middleware.example.io", plural)),
            annotations: Some(annotations),
            ..Default::default()
        },
        spec: CustomResourceDefinitionSpec {
            group: "middleware.example.io".into(),
            names: CustomResourceDefinitionNames {
                kind: kind.into(),
                list_kind: Some(format!("{}List", kind)),
                plural,
                singular: Some(kind.to_lowercase()),
                ..Default::default()
            },
            scope: "Namespaced".into(),
            versions: versions
                .iter()
                .map(|v| CustomResourceDefinitionVersion { name: v.to_string(), served: true, ..Default::default() })
                .collect(),
            ..Default::default()
        },
        status: None,
    }
}

#[tokio::test]
async fn discovery_publishes_one_descriptor_per_crd() {
    let cluster = MockCluster::new();
    cluster.set_crds(
        "MiddlewareCluster",
        vec![
            crd("RedisCluster", &["v1alpha1", "v1"], &[("harmonycloud.cn/phase", ".status.phase"), ("other/x", "y")]),
            crd("EsCluster", &["v1"], &[]),
            crd("Broken", &[], &[]),
        ],
    );
    let registry = SharedRegistry::default();
    let merged = discover(&cluster, "MiddlewareCluster", "harmonycloud", &registry).await.unwrap();
    assert_eq!(merged, 2);

    let reg = registry.current();
    assert_eq!(reg.len(), 2);
    let redis = reg.get("rediscluster").unwrap();
    assert_eq!(redis.version, "v1");
    assert_eq!(redis.list_kind, "RedisClusterList");
    assert_eq!(redis.status_mapping.len(), 1);
    assert!(reg.get("broken").is_none());
    assert_eq!(plan_controllers(&reg).len(), 2);
}

#[tokio::test]
async fn rediscovery_keeps_children_and_mappings() {
    let cluster = MockCluster::new();
    cluster.set_crds("MiddlewareCluster", vec![crd("EsCluster", &["v1"], &[("harmonycloud.cn/ready", ".status.ready")])]);
    let registry = SharedRegistry::default();
    discover(&cluster, "MiddlewareCluster", "harmonycloud", &registry).await.unwrap();

    let child = driftlog_core::TypeDescriptor {
        kind: "EsNode".into(),
        singular: "esnode".into(),
        ..Default::default()
    };
    registry.update(|r| assert!(r.attach_child("escluster", child)));

    cluster.set_crds("MiddlewareCluster", vec![crd("EsCluster", &["v1", "v2"], &[])]);
    discover(&cluster, "MiddlewareCluster", "harmonycloud", &registry).await.unwrap();

    let reg = registry.current();
    let es = reg.get("escluster").unwrap();
    assert_eq!(es.version, "v2");
    assert!(es.children.contains_key("esnode"));
    assert_eq!(es.status_mapping.get("harmonycloud.cn/ready").map(String::as_str), Some(".status.ready"));
}

#[tokio::test]
async fn listing_failure_leaves_registry_untouched() {
    let cluster = MockCluster::new();
    cluster.set_crds("MiddlewareCluster", vec![crd("EsCluster", &["v1"], &[])]);
    let registry = SharedRegistry::default();
    discover(&cluster, "MiddlewareCluster", "harmonycloud", &registry).await.unwrap();
    let before = registry.current();

    cluster.fail_next(1);
    assert!(discover(&cluster, "MiddlewareCluster", "harmonycloud", &registry).await.is_err());
    assert_eq!(*registry.current(), *before);
}

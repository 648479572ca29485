//! Pure `spec -> manifest` rendering for every object the operator owns.
//!
//! Rendering has no side effects and no client access; the reconcilers apply
//! whatever comes out of here with server-side apply. Every object carries a
//! controller owner reference back to its custom resource, so cascading
//! deletion is handled by the garbage collector once the finalizer releases.

pub mod configmap;
pub mod jobs;
pub mod secrets;
pub mod service;
pub mod workload;

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::api::ObjectMeta;
use kube::Resource;

/// Standard label set stamped on every rendered object.
pub fn labels(instance: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), "qdrant".to_string()),
        ("app.kubernetes.io/instance".to_string(), instance.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            "qdrant-operator".to_string(),
        ),
    ])
}

/// Metadata for an object owned by `owner`, named `name` in the same
/// namespace.
pub fn child_meta<K>(owner: &K, name: String) -> ObjectMeta
where
    K: Resource<DynamicType = ()>,
{
    ObjectMeta {
        name: Some(name),
        namespace: owner.meta().namespace.clone(),
        labels: Some(labels(owner.meta().name.as_deref().unwrap_or_default())),
        owner_references: owner.controller_owner_ref(&()).map(|r| vec![r]),
        ..ObjectMeta::default()
    }
}

/// Names of the objects rendered for a cluster.
pub mod names {
    /// The workload and the client service share the cluster name.
    #[must_use]
    pub fn workload(cluster: &str) -> String {
        cluster.to_string()
    }

    #[must_use]
    pub fn client_service(cluster: &str) -> String {
        cluster.to_string()
    }

    #[must_use]
    pub fn headless_service(cluster: &str) -> String {
        format!("{cluster}-headless")
    }

    #[must_use]
    pub fn config(cluster: &str) -> String {
        format!("{cluster}-config")
    }

    #[must_use]
    pub fn api_key_secret(cluster: &str) -> String {
        format!("{cluster}-apikey")
    }

    #[must_use]
    pub fn read_api_key_secret(cluster: &str) -> String {
        format!("{cluster}-read-apikey")
    }

    #[must_use]
    pub fn auth_secret(cluster: &str) -> String {
        format!("{cluster}-auth")
    }

    #[must_use]
    pub fn disruption_budget(cluster: &str) -> String {
        cluster.to_string()
    }

    #[must_use]
    pub fn snapshot_cron(owner: &str) -> String {
        format!("{owner}-snapshots")
    }
}

pub use self::{
    configmap::config_map,
    jobs::{backup_job, collection_snapshot_cron_job, restore_job, snapshot_cron_job},
    secrets::{api_key_secret, auth_secret, read_api_key_secret},
    service::{client_service, disruption_budget, headless_service},
    workload::stateful_set,
};

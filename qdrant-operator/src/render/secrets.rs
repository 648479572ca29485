//! API-key secrets and the composite auth secret qdrant reads them from.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use qdrant_operator_api::QdrantCluster;

use super::{child_meta, names};

/// Secret carrying the read-write API key, when one is configured.
pub fn api_key_secret(cluster: &QdrantCluster, name: &str) -> Option<Secret> {
    let key = cluster.spec.api_key()?;
    Some(string_secret(
        cluster,
        names::api_key_secret(name),
        "api-key",
        key,
    ))
}

/// Secret carrying the read-only API key, when one is configured.
pub fn read_api_key_secret(cluster: &QdrantCluster, name: &str) -> Option<Secret> {
    let key = cluster.spec.read_api_key()?;
    Some(string_secret(
        cluster,
        names::read_api_key_secret(name),
        "read-api-key",
        key,
    ))
}

/// The `local.yaml` secret derived from both keys, mounted into the pods.
///
/// qdrant merges this file over `config.yaml`, so keys stay out of the
/// ConfigMap. Rendered even when both keys are disabled so a key removal
/// propagates as an (empty) update rather than an orphaned secret.
pub fn auth_secret(cluster: &QdrantCluster, name: &str) -> Secret {
    let mut local = String::from("service:\n");
    if let Some(key) = cluster.spec.api_key() {
        local.push_str(&format!("  api_key: {key}\n"));
    }
    if let Some(key) = cluster.spec.read_api_key() {
        local.push_str(&format!("  read_only_api_key: {key}\n"));
    }
    string_secret(cluster, names::auth_secret(name), "local.yaml", &local)
}

fn string_secret(cluster: &QdrantCluster, name: String, key: &str, value: &str) -> Secret {
    Secret {
        metadata: child_meta(cluster, name),
        string_data: Some(BTreeMap::from([(key.to_string(), value.to_string())])),
        ..Secret::default()
    }
}

//! The qdrant configuration file mounted into every pod.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::ConfigMap;
use qdrant_operator_api::QdrantCluster;

use super::{child_meta, names};
use crate::qdrant::QDRANT_PORT;

/// gRPC port, always one above the HTTP port.
pub const GRPC_PORT: u16 = 6334;

/// Renders the `config.yaml` the qdrant process reads at startup.
///
/// API keys are deliberately absent here: they live in the auth secret and
/// are merged by qdrant from `local.yaml`, so rotating a key never needs a
/// config rollout.
pub fn config_map(cluster: &QdrantCluster, name: &str) -> ConfigMap {
    let tls_enabled = cluster.spec.tls_enabled();
    let mut config = format!(
        "log_level: INFO\n\
         storage:\n\
         \x20 storage_path: /qdrant/storage\n\
         \x20 snapshots_path: /qdrant/snapshots\n\
         service:\n\
         \x20 host: 0.0.0.0\n\
         \x20 http_port: {QDRANT_PORT}\n\
         \x20 grpc_port: {GRPC_PORT}\n\
         \x20 enable_tls: {tls_enabled}\n"
    );
    if tls_enabled {
        config.push_str(
            "tls:\n\
             \x20 cert: /qdrant/tls/tls.crt\n\
             \x20 key: /qdrant/tls/tls.key\n",
        );
    }

    ConfigMap {
        metadata: child_meta(cluster, names::config(name)),
        data: Some(BTreeMap::from([("config.yaml".to_string(), config)])),
        ..ConfigMap::default()
    }
}

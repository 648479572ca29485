//! The `QdrantCluster` custom resource.

use k8s_openapi::api::core::v1::{
    Affinity, Container, ResourceRequirements, Toleration, TopologySpreadConstraint, Volume,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::{CleanupPhase, Phase};
use crate::validate::InvalidSpec;

/// Desired state of a vector-search cluster.
///
/// The operator renders this spec into a stateful workload plus its
/// supporting objects (services, secrets, config, disruption budget,
/// snapshot schedule) and keeps them converged.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "qdrant.operator",
    version = "v1alpha1",
    kind = "QdrantCluster",
    plural = "qdrantclusters",
    status = "QdrantClusterStatus",
    shortname = "qc",
    namespaced,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.qdrantStatus"}"#,
    printcolumn = r#"{"name":"Replicas", "type":"integer", "jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct QdrantClusterSpec {
    /// Number of qdrant replicas in the workload. Must be at least 1.
    pub replicas: i32,
    /// Container image to run, e.g. `qdrant/qdrant:v1.16.3`.
    pub image: String,
    /// API key for the read-write endpoint. The literal string `"false"`
    /// disables authentication.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub apikey: Option<String>,
    /// API key for the read-only endpoint. The literal string `"false"`
    /// disables it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_apikey: Option<String>,
    /// TLS settings for the HTTP and gRPC endpoints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsSpec>,
    /// Persistent storage for the qdrant data directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceSpec>,
    /// Compute resources for the qdrant container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,
    /// Service type for the client-facing service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceKind>,
    /// Scheduling constraints applied to the workload pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<PlacementSpec>,
    /// Extra volumes mounted into the qdrant pods verbatim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_volumes: Vec<Volume>,
    /// Extra containers run alongside qdrant in each pod.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sidecar_containers: Vec<Container>,
    /// Periodic snapshot schedule.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<SnapshotSpec>,
}

/// TLS settings for a cluster's endpoints.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Serve HTTPS instead of HTTP on the collection endpoint.
    #[serde(default)]
    pub enabled: bool,
    /// Secret holding `tls.crt`/`tls.key` to mount into the pods.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

/// Persistent storage settings.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSpec {
    /// Requested volume size, e.g. `10Gi`.
    pub size: String,
    /// Storage class for the volume claims; cluster default when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

/// Service type of the client-facing service.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, Eq, PartialEq, JsonSchema)]
pub enum ServiceKind {
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl ServiceKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            ServiceKind::ClusterIP => "ClusterIP",
            ServiceKind::NodePort => "NodePort",
            ServiceKind::LoadBalancer => "LoadBalancer",
        }
    }
}

/// Pod scheduling constraints, passed through to the pod template.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub topology_spread_constraints: Vec<TopologySpreadConstraint>,
}

/// Periodic snapshot schedule for the cluster.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotSpec {
    /// Cron expression, e.g. `0 3 * * *`.
    pub schedule: String,
    /// How many snapshots to keep; older ones are pruned by the snapshot job.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_count: Option<u32>,
}

/// Observed state of a [`QdrantCluster`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QdrantClusterStatus {
    /// Lifecycle phase of the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qdrant_status: Option<Phase>,
    /// Fingerprint of the spec that produced the current workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_hash: Option<String>,
    /// Generation most recently acted upon by the operator.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    /// Human-readable detail for the `Error` phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Machine-readable reason for the `Error` phase, e.g. `InvalidSpec`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    /// Progress of finalizer cleanup once deletion has started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_phase: Option<CleanupPhase>,
    /// Number of cleanup attempts made so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_attempts: Option<u32>,
    /// Last cleanup failure, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_error: Option<String>,
}

impl QdrantClusterSpec {
    /// Validates the recognized spec fields.
    ///
    /// Structural schema validation happens at the API boundary; this covers
    /// the semantic rules the schema cannot express.
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        if self.replicas < 1 {
            return Err(InvalidSpec::Replicas {
                replicas: self.replicas,
            });
        }
        if self.image.trim().is_empty() {
            return Err(InvalidSpec::EmptyImage);
        }
        Ok(())
    }

    /// The effective read-write API key, `None` when disabled.
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        effective_key(self.apikey.as_deref())
    }

    /// The effective read-only API key, `None` when disabled.
    #[must_use]
    pub fn read_api_key(&self) -> Option<&str> {
        effective_key(self.read_apikey.as_deref())
    }

    /// Whether the collection endpoint serves HTTPS.
    #[must_use]
    pub fn tls_enabled(&self) -> bool {
        self.tls.as_ref().is_some_and(|tls| tls.enabled)
    }

    /// Service type of the client-facing service, defaulting to `ClusterIP`.
    #[must_use]
    pub fn service_kind(&self) -> ServiceKind {
        self.service.unwrap_or_default()
    }
}

// The sentinel "false" comes from the CRD surface, where disabling a key and
// setting one share a string-typed field.
fn effective_key(key: Option<&str>) -> Option<&str> {
    match key {
        Some("false") | Some("") | None => None,
        Some(key) => Some(key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(replicas: i32, image: &str) -> QdrantClusterSpec {
        serde_json::from_value(serde_json::json!({
            "replicas": replicas,
            "image": image,
        }))
        .unwrap()
    }

    #[test]
    fn accepts_minimal_spec() {
        assert!(minimal(1, "qdrant/qdrant:v1.16.3").validate().is_ok());
    }

    #[test]
    fn rejects_non_positive_replicas() {
        assert!(matches!(
            minimal(0, "qdrant/qdrant:v1.16.3").validate(),
            Err(InvalidSpec::Replicas { replicas: 0 })
        ));
    }

    #[test]
    fn rejects_empty_image() {
        assert!(matches!(minimal(1, "").validate(), Err(InvalidSpec::EmptyImage)));
        assert!(matches!(minimal(1, "  ").validate(), Err(InvalidSpec::EmptyImage)));
    }

    #[test]
    fn false_sentinel_disables_api_keys() {
        let mut spec = minimal(1, "qdrant/qdrant:v1.16.3");
        spec.apikey = Some("false".into());
        spec.read_apikey = Some("s3cret".into());
        assert_eq!(spec.api_key(), None);
        assert_eq!(spec.read_api_key(), Some("s3cret"));
    }

    #[test]
    fn status_uses_camel_case_field_names() {
        let status = QdrantClusterStatus {
            qdrant_status: Some(Phase::Pending),
            last_applied_hash: Some("0011223344556677".into()),
            ..QdrantClusterStatus::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_json_diff::assert_json_include!(
            actual: value,
            expected: serde_json::json!({
                "qdrantStatus": "Pending",
                "lastAppliedHash": "0011223344556677",
            })
        );
    }
}

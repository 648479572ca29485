//! The `QdrantCollection` custom resource and its ancillary kinds.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Condition;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::status::{CleanupPhase, Phase};
use crate::validate::InvalidSpec;

/// A logical collection hosted inside a [`QdrantCluster`](crate::QdrantCluster).
///
/// Unlike a cluster, the "real world" behind a collection is not a workload
/// but a remote HTTP collection on the cluster's endpoint.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "qdrant.operator",
    version = "v1alpha1",
    kind = "QdrantCollection",
    plural = "qdrantcollections",
    status = "QdrantCollectionStatus",
    shortname = "qcol",
    namespaced,
    printcolumn = r#"{"name":"Cluster", "type":"string", "jsonPath":".spec.cluster"}"#,
    printcolumn = r#"{"name":"Status", "type":"string", "jsonPath":".status.qdrantStatus"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct QdrantCollectionSpec {
    /// Name of the hosting `QdrantCluster` in the same namespace.
    pub cluster: String,
    /// Dimensionality of the stored vectors. Must be at least 1.
    pub vector_size: u64,
    /// Number of shards; defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_number: Option<u32>,
    /// Replication factor; defaults to 1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_factor: Option<u32>,
    /// Store vectors on disk instead of in memory.
    #[serde(default)]
    pub on_disk: bool,
    /// Name of a `QdrantCollectionTemplate` supplying defaults for any field
    /// left unset here.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub template: Option<String>,
    /// Extra collection configuration merged verbatim into the create request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
    /// Periodic snapshot schedule for this collection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshots: Option<CollectionSnapshotSpec>,
}

/// Snapshot schedule for a collection.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSnapshotSpec {
    /// Cron expression, e.g. `30 2 * * *`.
    pub schedule: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_count: Option<u32>,
}

/// Observed state of a [`QdrantCollection`].
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QdrantCollectionStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub qdrant_status: Option<Phase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_phase: Option<CleanupPhase>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_error: Option<String>,
}

impl QdrantCollectionSpec {
    /// Validates the recognized spec fields.
    pub fn validate(&self) -> Result<(), InvalidSpec> {
        if self.cluster.trim().is_empty() {
            return Err(InvalidSpec::EmptyCluster);
        }
        if self.vector_size < 1 {
            return Err(InvalidSpec::VectorSize {
                vector_size: self.vector_size,
            });
        }
        if let Some(shards) = self.shard_number {
            if shards < 1 {
                return Err(InvalidSpec::ShardNumber { shards });
            }
        }
        if let Some(replication) = self.replication_factor {
            if replication < 1 {
                return Err(InvalidSpec::ReplicationFactor { replication });
            }
        }
        Ok(())
    }

    /// Fills any unset field from a template.
    pub fn inherit(&mut self, template: &QdrantCollectionTemplateSpec) {
        if self.shard_number.is_none() {
            self.shard_number = template.shard_number;
        }
        if self.replication_factor.is_none() {
            self.replication_factor = template.replication_factor;
        }
        if self.config.is_none() {
            self.config.clone_from(&template.config);
        }
    }
}

/// Reusable collection configuration that collections may inherit from.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "qdrant.operator",
    version = "v1alpha1",
    kind = "QdrantCollectionTemplate",
    plural = "qdrantcollectiontemplates",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct QdrantCollectionTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard_number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replication_factor: Option<u32>,
    #[serde(default)]
    pub on_disk: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// One-shot restore of a collection from a snapshot.
///
/// Reconciled by spawning a restore job against the hosting cluster.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "qdrant.operator",
    version = "v1alpha1",
    kind = "QdrantCollectionRestore",
    plural = "qdrantcollectionrestores",
    status = "QdrantCollectionJobStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct QdrantCollectionRestoreSpec {
    /// Hosting cluster, in the same namespace.
    pub cluster: String,
    /// Collection to restore into.
    pub collection: String,
    /// Name of the snapshot to restore, as known to the cluster.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_name: Option<String>,
    /// URL to download the snapshot from instead of a named snapshot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_url: Option<String>,
}

/// One-shot snapshot of a collection.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "qdrant.operator",
    version = "v1alpha1",
    kind = "QdrantCollectionBackup",
    plural = "qdrantcollectionbackups",
    status = "QdrantCollectionJobStatus",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct QdrantCollectionBackupSpec {
    /// Hosting cluster, in the same namespace.
    pub cluster: String,
    /// Collection to snapshot.
    pub collection: String,
}

/// Status for the one-shot restore/backup kinds.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct QdrantCollectionJobStatus {
    /// Name of the job spawned for this resource, once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

//! Custom resource types for the qdrant operator.
//!
//! This crate defines the `qdrant.operator/v1alpha1` API group: the
//! [`QdrantCluster`] and [`QdrantCollection`] resources that users author,
//! plus the ancillary [`QdrantCollectionTemplate`], [`QdrantCollectionRestore`]
//! and [`QdrantCollectionBackup`] kinds. It also carries the pure helpers the
//! operator needs to reason about specs without talking to the cluster:
//! spec validation and the rollout [`fingerprint`].
//!
//! Nothing in this crate performs I/O.

pub mod cluster;
pub mod collection;
pub mod fingerprint;
pub mod status;
pub mod validate;

pub use cluster::{
    PersistenceSpec, PlacementSpec, QdrantCluster, QdrantClusterSpec, QdrantClusterStatus,
    ServiceKind, SnapshotSpec, TlsSpec,
};
pub use collection::{
    QdrantCollection, QdrantCollectionBackup, QdrantCollectionBackupSpec, QdrantCollectionRestore,
    QdrantCollectionRestoreSpec, QdrantCollectionSpec, QdrantCollectionStatus,
    QdrantCollectionTemplate, QdrantCollectionTemplateSpec,
};
pub use fingerprint::fingerprint;
pub use status::{ready_condition, CleanupPhase, Phase};
pub use validate::InvalidSpec;

/// API group for all custom resources defined here.
pub const GROUP: &str = "qdrant.operator";
/// API version for all custom resources defined here.
pub const VERSION: &str = "v1alpha1";
/// Finalizer sentinel that gates deletion of clusters and collections.
pub const FINALIZER: &str = "qdrant.operator/finalizer";
/// Field manager used for all server-side apply patches.
pub const MANAGER: &str = "qdrant-operator";

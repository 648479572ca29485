//! Semantic spec validation, shared across the operated kinds.
//!
//! Validation runs in the event router before anything is scheduled, so a
//! rejected spec never causes side effects. The error text ends up verbatim
//! in `.status.errorMessage`.

use thiserror::Error;

/// A spec that was rejected before reconciliation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum InvalidSpec {
    #[error("spec.replicas must be at least 1, got {replicas}")]
    Replicas { replicas: i32 },
    #[error("spec.image must not be empty")]
    EmptyImage,
    #[error("spec.cluster must reference a cluster in the same namespace")]
    EmptyCluster,
    #[error("spec.vectorSize must be at least 1, got {vector_size}")]
    VectorSize { vector_size: u64 },
    #[error("spec.shardNumber must be at least 1, got {shards}")]
    ShardNumber { shards: u32 },
    #[error("spec.replicationFactor must be at least 1, got {replication}")]
    ReplicationFactor { replication: u32 },
}

impl InvalidSpec {
    /// The machine-readable reason written to `.status.reason`.
    #[must_use]
    pub fn reason(&self) -> &'static str {
        "InvalidSpec"
    }
}

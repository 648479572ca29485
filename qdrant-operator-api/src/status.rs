//! Shared status vocabulary for the operated kinds.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Lifecycle phase reported in `.status.qdrantStatus`.
///
/// `Running` is a transient state between `Pending` and `Healthy`: the
/// workload has enough available and updated replicas, but not all of them
/// report ready yet.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq, JsonSchema)]
pub enum Phase {
    /// Desired state accepted, convergence in progress.
    Pending,
    /// Available and updated replicas have reached the desired count.
    Running,
    /// All replicas are available, updated and ready.
    Healthy,
    /// A rollout is in flight and readiness dropped below the desired count.
    OperationInProgress,
    /// The spec was rejected or a permanent operational failure occurred.
    Error,
}

impl Phase {
    /// Whether the resource is converged enough to serve traffic.
    #[must_use]
    pub fn is_ready(self) -> bool {
        matches!(self, Phase::Running | Phase::Healthy)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Running => "Running",
            Phase::Healthy => "Healthy",
            Phase::OperationInProgress => "OperationInProgress",
            Phase::Error => "Error",
        };
        f.write_str(s)
    }
}

/// Progress of finalizer cleanup, reported in `.status.cleanupPhase`.
#[derive(Clone, Copy, Debug, Deserialize, Serialize, Eq, PartialEq, JsonSchema)]
pub enum CleanupPhase {
    /// Cleanup failed at least once and will be retried.
    Retrying,
    /// Cleanup finished; the finalizer has been (or is about to be) released.
    Completed,
    /// Cleanup gave up: either the force-delete threshold was crossed and the
    /// finalizer was removed anyway, or the overall deadline expired.
    Failed,
}

/// Builds the `Ready` condition carried on every status write.
#[must_use]
pub fn ready_condition(
    ready: bool,
    reason: &str,
    message: &str,
    observed_generation: Option<i64>,
) -> Condition {
    Condition {
        type_: "Ready".to_string(),
        status: if ready { "True" } else { "False" }.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        observed_generation,
        last_transition_time: Time(chrono_now()),
    }
}

fn chrono_now() -> k8s_openapi::chrono::DateTime<k8s_openapi::chrono::Utc> {
    k8s_openapi::chrono::Utc::now()
}

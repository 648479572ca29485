//! Finalizer lifecycle: attach on first sight, safe teardown on deletion.
//!
//! Once a deletion timestamp is observed, the normal reconcile path is
//! bypassed and the cleanup state machine runs instead. Cleanup retries with
//! capped exponential backoff; after [`FORCE_ATTEMPTS`] failures the
//! finalizer is removed anyway (the escape hatch, trading cleanliness for
//! liveness), and past the per-kind deadline it gives up while keeping the
//! finalizer for manual intervention. The finalizer is released in no other
//! case before cleanup reports completion.

use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::{Api, Patch, PatchParams};
use kube::ResourceExt;
use qdrant_operator_api::{CleanupPhase, QdrantCluster, QdrantCollection, FINALIZER};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::backoff::ExponentialBackoff;
use crate::qdrant::QdrantClient;
use crate::reconcile::Context;
use crate::state::{Key, Operated};

/// Attempts considered "regular" retrying; beyond this the state machine is
/// in extended territory (backoff already saturated at the cap).
pub const REGULAR_ATTEMPTS: u32 = 5;
/// Attempts after which the finalizer is force-removed.
pub const FORCE_ATTEMPTS: u32 = 10;
/// Overall cleanup deadline for a cluster.
pub const CLUSTER_TIMEOUT: Duration = Duration::from_secs(300);
/// Overall cleanup deadline for a collection.
pub const COLLECTION_TIMEOUT: Duration = Duration::from_secs(120);

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

/// What to do after a failed cleanup attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextStep {
    /// Try again after backoff.
    Retry,
    /// Escape hatch: remove the finalizer despite the failure.
    ForceDelete,
    /// Deadline expired: mark failed and keep the finalizer.
    GiveUp,
}

/// Pure decision function for the cleanup state machine.
#[must_use]
pub fn next_step(attempts: u32, elapsed: Duration, deadline: Duration) -> NextStep {
    if elapsed > deadline {
        NextStep::GiveUp
    } else if attempts >= FORCE_ATTEMPTS {
        NextStep::ForceDelete
    } else {
        NextStep::Retry
    }
}

/// Adds the finalizer if absent. Merge-patching the full list is idempotent:
/// re-running with the finalizer present changes nothing.
pub async fn ensure_finalizer<K: Operated>(api: &Api<K>, obj: &K) -> kube::Result<()> {
    if obj.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(());
    }
    let name = obj.name_any();
    let mut finalizers: Vec<String> = obj.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    debug!(%name, "finalizer attached");
    Ok(())
}

/// Removes our finalizer, tolerating prior removal and concurrent edits.
async fn release_finalizer<K: Operated>(ctx: &Context, key: &Key) {
    let api: Api<K> = Api::namespaced(ctx.client.clone(), &key.namespace);
    for _ in 0..3 {
        let fresh = match api.get_opt(&key.name).await {
            Ok(Some(fresh)) => fresh,
            // Object already gone: release is moot.
            Ok(None) => return,
            Err(err) => {
                warn!(%key, error = %err, "failed to read object for finalizer release");
                return;
            }
        };
        let Some(index) = fresh.finalizers().iter().position(|f| f == FINALIZER) else {
            // Someone already removed it for us.
            return;
        };
        // The test operation makes the patch fail instead of removing a
        // different finalizer when the list changed under us.
        let path = format!("/metadata/finalizers/{index}");
        let Ok(patch) = serde_json::from_value::<json_patch::Patch>(json!([
            {"op": "test", "path": path, "value": FINALIZER},
            {"op": "remove", "path": path},
        ])) else {
            return;
        };
        match api
            .patch(&key.name, &PatchParams::default(), &Patch::Json::<K>(patch))
            .await
        {
            Ok(_) => {
                info!(%key, "finalizer released");
                return;
            }
            Err(kube::Error::Api(response)) if response.code == 404 => return,
            Err(kube::Error::Api(response)) if response.code == 409 || response.code == 422 => {
                // List moved underneath us; re-read and retry.
            }
            Err(err) => {
                warn!(%key, error = %err, "failed to release finalizer");
                return;
            }
        }
    }
    warn!(%key, "gave up releasing finalizer after repeated conflicts");
}

/// Runs cluster cleanup to completion (or the escape hatch).
pub async fn cluster(ctx: Arc<Context>, obj: QdrantCluster) {
    let Some(key) = Key::from_object(&obj) else {
        return;
    };
    // A dying cluster must not have its status resurrected by the tracker.
    ctx.state.abort_readiness(&key);

    let step_ctx = ctx.clone();
    let step_key = key.clone();
    drive::<QdrantCluster, _, _>(&ctx, &obj, &key, CLUSTER_TIMEOUT, move || {
        let ctx = step_ctx.clone();
        let key = step_key.clone();
        async move { scale_workload_to_zero(&ctx, &key).await }
    })
    .await;
}

/// Runs collection cleanup: delete the remote collection, idempotently.
pub async fn collection(ctx: Arc<Context>, obj: QdrantCollection) {
    let Some(key) = Key::from_object(&obj) else {
        return;
    };
    let cluster_name = obj.spec.cluster.clone();
    let collection_name = key.name.clone();

    let step_ctx = ctx.clone();
    let step_ns = key.namespace.clone();
    drive::<QdrantCollection, _, _>(&ctx, &obj, &key, COLLECTION_TIMEOUT, move || {
        let ctx = step_ctx.clone();
        let namespace = step_ns.clone();
        let cluster_name = cluster_name.clone();
        let collection_name = collection_name.clone();
        async move {
            delete_remote_collection(&ctx, &namespace, &cluster_name, &collection_name).await
        }
    })
    .await;
}

/// Shared cleanup driver: retry with backoff, then the escape hatch.
async fn drive<K, MkStep, Step>(
    ctx: &Arc<Context>,
    obj: &K,
    key: &Key,
    deadline: Duration,
    mut step: MkStep,
) where
    K: Operated,
    MkStep: FnMut() -> Step,
    Step: std::future::Future<Output = Result<(), String>>,
{
    let started = tokio::time::Instant::now();
    let mut attempts: u32 = 0;
    let mut backoff =
        ExponentialBackoff::new(BACKOFF_INITIAL, BACKOFF_CAP, REGULAR_ATTEMPTS);

    loop {
        match step().await {
            Ok(()) => {
                let _ = ctx
                    .status
                    .update(obj, |status| {
                        K::set_cleanup(status, CleanupPhase::Completed, attempts, None);
                    })
                    .await;
                release_finalizer::<K>(ctx, key).await;
                info!(%key, attempts, "cleanup completed");
                return;
            }
            Err(message) => {
                attempts += 1;
                match next_step(attempts, started.elapsed(), deadline) {
                    NextStep::Retry => {
                        debug!(%key, attempts, %message, "cleanup attempt failed, retrying");
                        let _ = ctx
                            .status
                            .update(obj, |status| {
                                K::set_cleanup(
                                    status,
                                    CleanupPhase::Retrying,
                                    attempts,
                                    Some(message.clone()),
                                );
                            })
                            .await;
                        // The backoff saturates at the cap, which is exactly
                        // the extended-retry band between REGULAR and FORCE.
                        if let Some(delay) = backoff.next() {
                            tokio::time::sleep(delay).await;
                        }
                    }
                    NextStep::ForceDelete => {
                        warn!(%key, attempts, %message, "cleanup exhausted, force-removing finalizer");
                        ctx.metrics.cleanup_force_deletes.inc();
                        ctx.metrics
                            .errors
                            .with_label_values(&["cleanup_force_delete"])
                            .inc();
                        let _ = ctx
                            .status
                            .update(obj, |status| {
                                K::set_cleanup(
                                    status,
                                    CleanupPhase::Failed,
                                    attempts,
                                    Some(message.clone()),
                                );
                            })
                            .await;
                        release_finalizer::<K>(ctx, key).await;
                        return;
                    }
                    NextStep::GiveUp => {
                        warn!(%key, attempts, %message, "cleanup deadline expired, leaving finalizer in place");
                        let _ = ctx
                            .status
                            .update(obj, |status| {
                                K::set_cleanup(
                                    status,
                                    CleanupPhase::Failed,
                                    attempts,
                                    Some(message),
                                );
                            })
                            .await;
                        return;
                    }
                }
            }
        }
    }
}

/// Cluster teardown step. Not-found at any point is success: an external
/// actor may have removed the workload already.
async fn scale_workload_to_zero(ctx: &Context, key: &Key) -> Result<(), String> {
    let api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &key.namespace);
    match api.get_opt(&key.name).await {
        Ok(None) => return Ok(()),
        Ok(Some(_)) => {}
        Err(err) => return Err(format!("failed to read workload: {err}")),
    }
    let patch = json!({"spec": {"replicas": 0}});
    match api
        .patch(&key.name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
        Err(err) => Err(format!("failed to scale workload down: {err}")),
    }
}

/// Collection teardown step. A missing cluster means there is nowhere the
/// collection could still live, which is success.
async fn delete_remote_collection(
    ctx: &Context,
    namespace: &str,
    cluster_name: &str,
    collection_name: &str,
) -> Result<(), String> {
    let cluster_key = Key::new(namespace, cluster_name);
    let cached = QdrantCluster::kind_state(&ctx.state).lock().get(&cluster_key);
    let cluster = match cached {
        Some(cluster) => Some(cluster),
        None => {
            let api: Api<QdrantCluster> = Api::namespaced(ctx.client.clone(), namespace);
            match api.get_opt(cluster_name).await {
                Ok(cluster) => cluster,
                Err(err) => return Err(format!("failed to read cluster: {err}")),
            }
        }
    };
    let Some(cluster) = cluster else {
        return Ok(());
    };
    let client = QdrantClient::for_cluster(&cluster, namespace, cluster_name)
        .map_err(|err| format!("failed to build cluster client: {err}"))?;
    client
        .delete_collection(collection_name)
        .await
        .map_err(|err| format!("failed to delete collection: {err}"))
}

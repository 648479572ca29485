//! Watches a cluster's workload until it converges, then publishes
//! `Running`/`Healthy` without polling.
//!
//! One tracker runs per cluster that has a rollout in flight. It follows the
//! StatefulSet through a single-object watch, logs only when the
//! availability ratio changes, and exits once the cluster reports `Healthy`
//! (or the workload disappears). Stream errors reconnect after a fixed
//! delay; if the watch cannot be established at all the surrounding loop
//! degrades into 5-second polling, since every iteration re-reads the
//! object before watching it.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetStatus};
use kube::api::{Api, WatchEvent, WatchParams};
use kube::{Client, ResourceExt};
use qdrant_operator_api::{Phase, QdrantCluster};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::state::{ControlState, Key, Operated};
use crate::status::StatusWriter;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// The phase implied by a workload status, given the desired replica count.
///
/// `None` means the rollout has not converged yet.
#[must_use]
pub fn phase_for(status: &StatefulSetStatus, desired: i32) -> Option<Phase> {
    let available = status.available_replicas.unwrap_or(0);
    let updated = status.updated_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);
    if available >= desired && updated >= desired {
        if ready >= desired {
            Some(Phase::Healthy)
        } else {
            Some(Phase::Running)
        }
    } else {
        None
    }
}

fn availability(status: &StatefulSetStatus) -> (i32, i32) {
    (
        status.available_replicas.unwrap_or(0),
        status.ready_replicas.unwrap_or(0),
    )
}

/// Starts (or restarts) the readiness watch for a cluster.
pub fn spawn(
    client: Client,
    status_writer: Arc<StatusWriter>,
    state: Arc<ControlState>,
    cluster: QdrantCluster,
) {
    let Some(key) = Key::from_object(&cluster) else {
        return;
    };
    let token = CancellationToken::new();
    state.register_readiness(&key, token.clone());
    tokio::spawn(run(client, status_writer, state, cluster, key, token));
}

async fn run(
    client: Client,
    status_writer: Arc<StatusWriter>,
    state: Arc<ControlState>,
    cluster: QdrantCluster,
    key: Key,
    token: CancellationToken,
) {
    let api: Api<StatefulSet> = Api::namespaced(client, &key.namespace);
    let desired = cluster.spec.replicas;
    let mut last_seen = None;

    debug!(%key, desired, "readiness watch started");
    loop {
        if token.is_cancelled() {
            return;
        }

        // Fresh read: the decision basis, and the resource version to watch
        // from. Doubling as the 5s polling fallback when the watch cannot be
        // established.
        let workload = tokio::select! {
            () = token.cancelled() => return,
            result = api.get_opt(&key.name) => match result {
                Ok(Some(workload)) => workload,
                Ok(None) => {
                    debug!(%key, "workload gone, readiness watch exiting");
                    return;
                }
                Err(err) => {
                    warn!(%key, error = %err, "readiness read failed");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    continue;
                }
            },
        };
        if report(&status_writer, &state, &key, &workload, desired, &mut last_seen).await {
            return;
        }

        let resource_version = workload.resource_version().unwrap_or_default();
        let wp = WatchParams::default().fields(&format!("metadata.name={}", key.name));
        let stream = match api.watch(&wp, &resource_version).await {
            Ok(stream) => stream,
            Err(err) => {
                warn!(%key, error = %err, "readiness watch failed to start, falling back to polling");
                tokio::time::sleep(RECONNECT_DELAY).await;
                continue;
            }
        };
        futures::pin_mut!(stream);

        loop {
            let event = tokio::select! {
                () = token.cancelled() => return,
                event = stream.next() => event,
            };
            match event {
                Some(Ok(WatchEvent::Added(workload) | WatchEvent::Modified(workload))) => {
                    if report(&status_writer, &state, &key, &workload, desired, &mut last_seen)
                        .await
                    {
                        return;
                    }
                }
                Some(Ok(WatchEvent::Deleted(_))) => {
                    debug!(%key, "workload deleted, readiness watch exiting");
                    return;
                }
                Some(Ok(WatchEvent::Bookmark(_))) => {}
                Some(Ok(WatchEvent::Error(response))) if response.code == 404 => {
                    debug!(%key, "workload not found, readiness watch exiting");
                    return;
                }
                Some(Ok(WatchEvent::Error(response))) => {
                    warn!(%key, code = response.code, "readiness watch error, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    break;
                }
                Some(Err(err)) => {
                    warn!(%key, error = %err, "readiness stream failed, reconnecting");
                    tokio::time::sleep(RECONNECT_DELAY).await;
                    break;
                }
                None => break,
            }
        }
    }
}

/// Evaluates one workload observation. Returns `true` when the watch is done.
async fn report(
    status_writer: &Arc<StatusWriter>,
    state: &Arc<ControlState>,
    key: &Key,
    workload: &StatefulSet,
    desired: i32,
    last_seen: &mut Option<(i32, i32)>,
) -> bool {
    let Some(workload_status) = workload.status.as_ref() else {
        return false;
    };

    let ratio = availability(workload_status);
    if *last_seen != Some(ratio) {
        info!(%key, available = ratio.0, ready = ratio.1, desired, "workload availability changed");
        *last_seen = Some(ratio);
    }

    let Some(cluster) = QdrantCluster::kind_state(state).lock().get(key) else {
        // Cluster untracked (deleted mid-rollout); nothing to report against.
        return true;
    };
    let current = cluster.phase();

    match phase_for(workload_status, desired) {
        Some(phase) => {
            if current != Some(phase) {
                if let Err(err) = status_writer.write_phase(&cluster, phase).await {
                    warn!(%key, error = %err, "failed to publish readiness phase");
                }
            }
            phase == Phase::Healthy
        }
        None => {
            // A rollout degraded a previously converged cluster.
            if matches!(current, Some(Phase::Running | Phase::Healthy)) {
                if let Err(err) = status_writer
                    .write_phase(&cluster, Phase::OperationInProgress)
                    .await
                {
                    warn!(%key, error = %err, "failed to publish rollout phase");
                }
            }
            false
        }
    }
}

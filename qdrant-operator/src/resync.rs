//! Periodic resync: re-queues every tracked resource.
//!
//! Watches can drop events (disconnects, missed notifications, the operator
//! being down); the sweep closes those gaps by pushing every known key back
//! through the debounced queue. Reconciles are idempotent, so a redundant
//! sweep costs a few cheap applies and nothing else. This is also what
//! catches external drift: a mutated workload is found by the fingerprint
//! check on the next swept reconcile.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::queue::{Enqueue, QueueSender};
use crate::reconcile::Context;
use crate::state::{ControlState, Request, ResourceKind};

/// Interval between sweeps.
pub const RESYNC_PERIOD: Duration = Duration::from_secs(30);

/// Queues one reconcile request per tracked resource; returns how many.
pub fn sweep(state: &ControlState, sched_tx: &QueueSender) -> usize {
    let mut queued = 0;
    for key in state.clusters.lock().keys() {
        let request = Request {
            kind: ResourceKind::Cluster,
            key,
        };
        if sched_tx.send(Enqueue::now(request)).is_ok() {
            queued += 1;
        }
    }
    for key in state.collections.lock().keys() {
        let request = Request {
            kind: ResourceKind::Collection,
            key,
        };
        if sched_tx.send(Enqueue::now(request)).is_ok() {
            queued += 1;
        }
    }
    queued
}

/// Timer loop driving [`sweep`] until aborted.
pub async fn run(ctx: Arc<Context>, token: CancellationToken) {
    let start = tokio::time::Instant::now() + RESYNC_PERIOD;
    let mut interval = tokio::time::interval_at(start, RESYNC_PERIOD);
    loop {
        tokio::select! {
            () = token.cancelled() => return,
            _ = interval.tick() => {}
        }
        if ctx.state.is_shutting_down() {
            return;
        }
        let queued = sweep(&ctx.state, &ctx.sched_tx);
        debug!(queued, "resync sweep");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Key;
    use qdrant_operator_api::QdrantCluster;
    use tokio::sync::mpsc;

    fn cluster(name: &str) -> QdrantCluster {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "qdrant.operator/v1alpha1",
            "kind": "QdrantCluster",
            "metadata": {"name": name, "namespace": "default", "resourceVersion": "1"},
            "spec": {"replicas": 1, "image": "qdrant/qdrant:v1.16.3"},
        }))
        .unwrap()
    }

    #[test]
    fn sweep_queues_every_tracked_key() {
        let state = ControlState::default();
        state
            .clusters
            .lock()
            .track(&Key::new("default", "a"), "1", cluster("a"));
        state
            .clusters
            .lock()
            .track(&Key::new("default", "b"), "1", cluster("b"));
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(sweep(&state, &tx), 2);
        let first = rx.try_recv().unwrap();
        assert_eq!(first.request.kind, ResourceKind::Cluster);
    }

    #[test]
    fn sweep_of_nothing_queues_nothing() {
        let state = ControlState::default();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(sweep(&state, &tx), 0);
        assert!(rx.try_recv().is_err());
    }
}

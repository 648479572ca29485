//! Wires the components together and supervises the shutdown path.
//!
//! Order matters: the lease is held before any watch starts, watches feed
//! the router, and the router feeds the work queue, which debounces per key
//! and dispatches single-flight reconciles. Leadership loss and termination
//! signals share one drain path: latch the shutdown flag, abort the
//! watches, wait (bounded) for active reconciles, then exit.

use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use kube::api::{Api, WatchParams};
use kube::Client;
use qdrant_operator_api::{QdrantCluster, QdrantCollection};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::leader::{LeaderState, LeaseElector};
use crate::metrics::Metrics;
use crate::queue::{WorkQueue, RECONCILE_DEBOUNCE};
use crate::reconcile::{self, Context};
use crate::router::Router;
use crate::state::{ControlState, Request};
use crate::{resync, watcher};

/// Hard cap on waiting for in-flight reconciles during shutdown.
pub const DRAIN_CAP: Duration = Duration::from_secs(30);

/// Runs the operator until leadership is lost or a termination signal
/// arrives. Blocks on lease acquisition first; standby instances park here.
pub async fn run(client: Client, settings: Settings, metrics: Arc<Metrics>) -> crate::Result<()> {
    let leader = LeaseElector::spawn(
        client.clone(),
        &settings.pod_namespace,
        &settings.pod_name,
        metrics.leader.clone(),
    );
    info!(identity = %settings.pod_name, "waiting for leadership");
    leader.wait_leading().await;
    info!("acquired leadership, starting control loop");

    let state = Arc::new(ControlState::default());
    let status = crate::status::StatusWriter::new(client.clone(), state.clone());
    let (sched_tx, sched_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(Context {
        client: client.clone(),
        state: state.clone(),
        status,
        metrics: metrics.clone(),
        settings,
        sched_tx,
    });
    let router = Router::new(ctx.clone());
    router.register_replay();

    let watch_token = CancellationToken::new();

    let clusters: Api<QdrantCluster> = Api::all(client.clone());
    let cluster_watch = tokio::spawn(Arc::clone(&router).run(watcher::events(
        clusters,
        WatchParams::default(),
        watch_token.child_token(),
        metrics.watch_restarts.clone(),
    )));
    let collections: Api<QdrantCollection> = Api::all(client.clone());
    let collection_watch = tokio::spawn(Arc::clone(&router).run(watcher::events(
        collections,
        WatchParams::default(),
        watch_token.child_token(),
        metrics.watch_restarts.clone(),
    )));
    metrics.active_watches.set(2);

    // The queue owns the shutdown check, the active set and the depth
    // gauge; the reconcile closure is just the dispatch target.
    let queue = WorkQueue::new(sched_rx, state.clone(), RECONCILE_DEBOUNCE)
        .with_depth_gauge(metrics.queue_depth.clone());
    let queue_ctx = ctx.clone();
    let queue_task = tokio::spawn(queue.run(move |request: Request| {
        let ctx = queue_ctx.clone();
        reconcile::reconcile(ctx, request).boxed()
    }));

    let resync_task = tokio::spawn(resync::run(ctx.clone(), watch_token.child_token()));

    let reason = wait_for_shutdown(&leader, &state).await?;
    info!(reason, "beginning graceful shutdown");

    state.begin_shutdown();
    watch_token.cancel();
    if !state.drained(DRAIN_CAP).await {
        warn!(
            active = state.active_count(),
            "drain cap expired with reconciles still in flight"
        );
    }
    queue_task.abort();
    let _ = cluster_watch.await;
    let _ = collection_watch.await;
    let _ = resync_task.await;
    metrics.active_watches.set(0);
    leader.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

/// Blocks until something ends this instance's reign: a termination signal,
/// or the lease observed in another holder's hands.
async fn wait_for_shutdown(
    leader: &crate::leader::LeaderHandle,
    state: &Arc<ControlState>,
) -> crate::Result<&'static str> {
    let mut sigterm =
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    let mut leadership = leader.state();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => return Ok("interrupt"),
            _ = sigterm.recv() => return Ok("terminated"),
            changed = leadership.changed() => {
                if changed.is_err() {
                    return Ok("elector stopped");
                }
                let current = leadership.borrow_and_update().clone();
                match current {
                    LeaderState::Leading => {}
                    // An empty holder is the startup/handover window, not a
                    // usurper; keep renewing.
                    LeaderState::Standby => {}
                    LeaderState::Following { holder } => {
                        warn!(
                            %holder,
                            active = state.active_count(),
                            "lease held by another instance"
                        );
                        return Ok("leadership lost");
                    }
                }
            }
        }
    }
}

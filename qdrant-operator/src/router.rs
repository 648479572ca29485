//! Translates watch events into safe, idempotent control actions.
//!
//! The order of checks in [`Router::observe`] is load-bearing:
//!
//! 1. buffer the event if a status write holds the key locked;
//! 2. validate the spec, *before* dedup, so the very first event of an
//!    invalid object is reported instead of being absorbed by the version
//!    check on a later replay;
//! 3. deduplicate by resource version;
//! 4. record the version and cache the spec;
//! 5. deletions go to cleanup, bypassing reconciliation;
//! 6. everything else gets the finalizer ensured and a reconcile scheduled.
//!
//! Reordering 2 and 3 loses error reports; reordering 5 and 6 re-attaches
//! finalizers to dying objects.

use std::collections::HashSet;
use std::sync::Arc;

use futures::{Stream, StreamExt};
use kube::api::Api;
use kube::{Resource as _, ResourceExt};
use qdrant_operator_api::{QdrantCluster, QdrantCollection};
use tracing::{debug, warn};

use crate::cleanup;
use crate::queue::Enqueue;
use crate::reconcile::Context;
use crate::state::{ControlState, Key, Operated, PendingEvent, Request, ResourceKind};
use crate::watcher::Event;

/// Kind-specific hooks the router needs beyond [`Operated`].
pub trait Routed: Operated {
    /// Runs this kind's cleanup to completion.
    fn cleanup(ctx: Arc<Context>, obj: Self) -> impl std::future::Future<Output = ()> + Send;

    /// Drops any per-key side state owned outside the kind map.
    fn drop_side_state(_state: &ControlState, _key: &Key) {}
}

impl Routed for QdrantCluster {
    async fn cleanup(ctx: Arc<Context>, obj: Self) {
        cleanup::cluster(ctx, obj).await;
    }

    fn drop_side_state(state: &ControlState, key: &Key) {
        state.abort_readiness(key);
        state.cache_workload(key, None);
    }
}

impl Routed for QdrantCollection {
    async fn cleanup(ctx: Arc<Context>, obj: Self) {
        cleanup::collection(ctx, obj).await;
    }
}

pub struct Router {
    ctx: Arc<Context>,
}

impl Router {
    pub fn new(ctx: Arc<Context>) -> Arc<Self> {
        Arc::new(Self { ctx })
    }

    /// Wires this router in as the status writer's replay target.
    ///
    /// The status writer only knows an opaque callback; the cycle between
    /// "router writes status" and "status writer replays into the router" is
    /// closed here at startup rather than in the module graph. The callback
    /// holds a weak reference so the router can still be dropped.
    pub fn register_replay(self: &Arc<Self>) {
        let weak = Arc::downgrade(self);
        self.ctx.status.set_replayer(Box::new(move |kind, key| {
            if let Some(router) = weak.upgrade() {
                tokio::spawn(async move { router.replay(kind, key).await });
            }
        }));
    }

    /// Drives one kind's event stream until it ends (abort or shutdown).
    pub async fn run<K: Routed>(self: Arc<Self>, stream: impl Stream<Item = Event<K>>) {
        futures::pin_mut!(stream);
        while let Some(event) = stream.next().await {
            if self.ctx.state.is_shutting_down() {
                return;
            }
            match event {
                Event::Applied(obj) => self.observe(PendingEvent::Applied(obj)).await,
                Event::Deleted(obj) => self.observe(PendingEvent::Deleted(obj)).await,
                Event::Restarted(objs) => self.relist(objs).await,
            }
        }
    }

    /// A relist replaces our view atomically: anything we track that the
    /// list does not contain was deleted while the stream was down.
    async fn relist<K: Routed>(&self, objs: Vec<K>) {
        let live: HashSet<Key> = objs.iter().filter_map(Key::from_object).collect();
        let gone = K::kind_state(&self.ctx.state).lock().retain_live(&live);
        for key in &gone {
            debug!(%key, kind = %K::KIND, "dropped while watch was down");
            K::drop_side_state(&self.ctx.state, key);
        }
        self.update_managed_gauge::<K>();
        for obj in objs {
            self.observe(PendingEvent::Applied(obj)).await;
        }
    }

    /// Replays events buffered during a status write. Invoked through the
    /// injected callback, one spawned task per release, events in order.
    pub async fn replay(self: Arc<Self>, kind: ResourceKind, key: Key) {
        match kind {
            ResourceKind::Cluster => {
                let events = self.ctx.state.clusters.lock().unlock_status(&key);
                for event in events {
                    self.observe(event).await;
                }
            }
            ResourceKind::Collection => {
                let events = self.ctx.state.collections.lock().unlock_status(&key);
                for event in events {
                    self.observe(event).await;
                }
            }
        }
    }

    async fn observe<K: Routed>(&self, event: PendingEvent<K>) {
        if self.ctx.state.is_shutting_down() {
            return;
        }
        let Some(key) = (match &event {
            PendingEvent::Applied(obj) | PendingEvent::Deleted(obj) => Key::from_object(obj),
        }) else {
            return;
        };

        let Some(event) = K::kind_state(&self.ctx.state)
            .lock()
            .buffer_if_locked(&key, event)
        else {
            debug!(%key, "status write in flight, buffered event");
            return;
        };

        let obj = match event {
            PendingEvent::Deleted(_) => {
                // The object is gone from the API server; cleanup already ran
                // off the deletion timestamp. Just drop tracking.
                K::kind_state(&self.ctx.state).lock().forget(&key);
                K::drop_side_state(&self.ctx.state, &key);
                self.update_managed_gauge::<K>();
                return;
            }
            PendingEvent::Applied(obj) => obj,
        };

        let Some(resource_version) = obj.resource_version() else {
            return;
        };

        if let Err(invalid) = obj.validate_spec() {
            warn!(%key, error = %invalid, "rejecting invalid spec");
            self.ctx
                .metrics
                .errors
                .with_label_values(&["invalid_spec"])
                .inc();
            if let Err(err) = self
                .ctx
                .status
                .write_error(&obj, invalid.reason(), &invalid.to_string())
                .await
            {
                warn!(%key, error = %err, "failed to publish invalid-spec status");
            }
            // Remember the version so this exact event is not reprocessed,
            // but do not schedule: only a spec edit can fix it.
            K::kind_state(&self.ctx.state)
                .lock()
                .observe_version(&key, &resource_version);
            return;
        }

        if K::kind_state(&self.ctx.state)
            .lock()
            .is_duplicate(&key, &resource_version)
        {
            return;
        }

        K::kind_state(&self.ctx.state)
            .lock()
            .track(&key, &resource_version, obj.clone());
        self.update_managed_gauge::<K>();

        if obj.meta().deletion_timestamp.is_some() {
            self.start_cleanup(key, obj);
            return;
        }

        let api: Api<K> = Api::namespaced(self.ctx.client.clone(), &key.namespace);
        if let Err(err) = cleanup::ensure_finalizer(&api, &obj).await {
            // The attach will be retried on the next event or resync pass;
            // reconciling without it is still safe, deletion just cannot
            // start until it sticks.
            warn!(%key, error = %err, "failed to attach finalizer");
        }
        self.schedule(K::KIND, key);
    }

    fn schedule(&self, kind: ResourceKind, key: Key) {
        let _ = self.ctx.sched_tx.send(Enqueue::now(Request { kind, key }));
    }

    fn start_cleanup<K: Routed>(&self, key: Key, obj: K) {
        if !K::kind_state(&self.ctx.state).lock().begin_cleanup(&key) {
            debug!(%key, "cleanup already in flight");
            return;
        }
        let ctx = self.ctx.clone();
        tokio::spawn(async move {
            let state = ctx.state.clone();
            let metrics = ctx.metrics.clone();
            K::cleanup(ctx, obj).await;
            {
                let mut kind_state = K::kind_state(&state).lock();
                kind_state.end_cleanup(&key);
                kind_state.forget(&key);
            }
            K::drop_side_state(&state, &key);
            metrics
                .managed
                .with_label_values(&[K::KIND.as_str()])
                .set(K::kind_state(&state).lock().len() as i64);
        });
    }

    fn update_managed_gauge<K: Routed>(&self) {
        let count = K::kind_state(&self.ctx.state).lock().len();
        self.ctx
            .metrics
            .managed
            .with_label_values(&[K::KIND.as_str()])
            .set(count as i64);
    }
}

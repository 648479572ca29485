//! Reconcilers: converge the real world to a resource's spec.

pub mod cluster;
pub mod collection;

use std::fmt::Debug;
use std::sync::Arc;

use kube::api::{Api, Patch, PatchParams};
use kube::{Client, Resource};
use qdrant_operator_api::MANAGER;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::Settings;
use crate::metrics::Metrics;
use crate::queue::{Enqueue, QueueSender};
use crate::state::{ControlState, Request, ResourceKind};
use crate::status::StatusWriter;

/// Delay before a failed reconcile is re-queued.
pub const RETRY_DELAY: std::time::Duration = std::time::Duration::from_secs(10);

/// Everything a reconcile (or cleanup) needs, shared across tasks.
#[derive(Clone)]
pub struct Context {
    pub client: Client,
    pub state: Arc<ControlState>,
    pub status: Arc<StatusWriter>,
    pub metrics: Arc<Metrics>,
    pub settings: Settings,
    /// Feed back into the work queue, used for delayed retries.
    pub sched_tx: QueueSender,
}

impl Context {
    /// Re-queues the request after `delay` (plus the usual debounce).
    pub fn schedule_retry(&self, request: Request, delay: std::time::Duration) {
        let _ = self.sched_tx.send(Enqueue::after(request, delay));
    }

    /// Image used for snapshot/backup/restore jobs.
    #[must_use]
    pub fn job_image(&self) -> &str {
        self.settings
            .job_image
            .as_deref()
            .unwrap_or(crate::render::jobs::DEFAULT_JOB_IMAGE)
    }
}

/// Applies an object with server-side apply, taking ownership of the fields
/// this operator manages.
///
/// `k8s-openapi` types do not serialize their type metadata, which apply
/// requires, so it is injected from the type before patching.
pub async fn apply<T>(client: Client, namespace: &str, obj: &T) -> crate::Result<()>
where
    T: Resource<DynamicType = (), Scope = kube::core::NamespaceResourceScope>
        + Serialize
        + DeserializeOwned
        + Clone
        + Debug,
{
    let name = obj
        .meta()
        .name
        .clone()
        .ok_or(crate::Error::MissingObjectKey(".metadata.name"))?;
    let mut value = serde_json::to_value(obj)?;
    value["apiVersion"] = serde_json::Value::String(T::api_version(&()).into_owned());
    value["kind"] = serde_json::Value::String(T::kind(&()).into_owned());
    let api: Api<T> = Api::namespaced(client, namespace);
    api.patch(&name, &PatchParams::apply(MANAGER).force(), &Patch::Apply(&value))
        .await?;
    Ok(())
}

/// Entry point the work queue dispatches for every due request.
///
/// Errors never escape: they are counted, surfaced on status where
/// attributable, and retried through the queue.
pub async fn reconcile(ctx: Arc<Context>, request: Request) {
    let kind = request.kind.as_str();
    let timer = ctx
        .metrics
        .reconcile_duration
        .with_label_values(&[kind])
        .start_timer();
    let result = match request.kind {
        ResourceKind::Cluster => cluster::reconcile(&ctx, &request).await,
        ResourceKind::Collection => collection::reconcile(&ctx, &request).await,
    };
    timer.observe_duration();
    match result {
        Ok(()) => {
            ctx.metrics
                .reconciles
                .with_label_values(&[kind, "ok"])
                .inc();
        }
        Err(err) => {
            tracing::warn!(key = %request.key, kind, error = %err, "reconcile failed");
            ctx.metrics
                .reconciles
                .with_label_values(&[kind, "error"])
                .inc();
            ctx.metrics
                .errors
                .with_label_values(&[err.metric_label()])
                .inc();
            ctx.schedule_retry(request.clone(), RETRY_DELAY);
        }
    }
}

//! Cluster reconciliation: render the desired objects, detect drift via the
//! spec fingerprint, and hand convergence off to the readiness tracker.

use std::sync::Arc;

use k8s_openapi::api::apps::v1::StatefulSet;
use kube::api::Api;
use qdrant_operator_api::{fingerprint, Phase, QdrantCluster};
use tracing::{debug, info};

use super::{apply, Context};
use crate::error::Result;
use crate::readiness;
use crate::render;
use crate::state::{Key, Operated as _, Request};

pub async fn reconcile(ctx: &Arc<Context>, request: &Request) -> Result<()> {
    let key = &request.key;
    let api: Api<QdrantCluster> = Api::namespaced(ctx.client.clone(), &key.namespace);

    // Spec from cache when possible; the API read covers cache misses after
    // a restart.
    let cached = QdrantCluster::kind_state(&ctx.state).lock().get(key);
    let cluster = match cached {
        Some(cluster) => cluster,
        None => match api.get_opt(&key.name).await? {
            Some(cluster) => cluster,
            None => {
                debug!(%key, "cluster vanished before reconcile");
                return Ok(());
            }
        },
    };
    if cluster.metadata.deletion_timestamp.is_some() {
        // Deletions take the cleanup path via the router.
        return Ok(());
    }

    let sts_api: Api<StatefulSet> = Api::namespaced(ctx.client.clone(), &key.namespace);
    // Cached workload view first, API on miss; the API answer (including
    // not-found, a valid observation) is what decisions are based on.
    let observed = match ctx.state.cached_workload(key) {
        Some(workload) => Some(workload),
        None => sts_api.get_opt(&key.name).await?,
    };

    let hash = fingerprint(&cluster.spec);

    let Some(_observed) = observed else {
        info!(%key, %hash, "workload absent, creating cluster objects");
        ctx.status.write_phase(&cluster, Phase::Pending).await?;
        apply_supporting_objects(ctx, &cluster, key).await?;
        apply_workload(ctx, &cluster, key).await?;
        refresh_workload_cache(ctx, &sts_api, key).await?;
        write_applied_hash(ctx, &cluster, &hash).await?;
        readiness::spawn(
            ctx.client.clone(),
            ctx.status.clone(),
            ctx.state.clone(),
            cluster,
        );
        return Ok(());
    };

    let prior = cluster
        .status
        .as_ref()
        .and_then(|status| status.last_applied_hash.clone());

    if prior.as_deref() == Some(hash.as_str()) {
        // No drift. The cheap resources are still re-applied every pass:
        // they are idempotent and cannot cause a rollout, and this heals
        // external edits to services, config or secrets.
        apply_supporting_objects(ctx, &cluster, key).await?;

        if !matches!(cluster.phase(), Some(Phase::Running | Phase::Healthy)) {
            // Status lagged behind (e.g. operator restart mid-rollout):
            // verify readiness with a direct read rather than waiting for
            // the next workload event.
            match sts_api.get_opt(&key.name).await? {
                Some(workload) => {
                    let phase = workload
                        .status
                        .as_ref()
                        .and_then(|status| readiness::phase_for(status, cluster.spec.replicas));
                    match phase {
                        Some(phase) => ctx.status.write_phase(&cluster, phase).await?,
                        None => readiness::spawn(
                            ctx.client.clone(),
                            ctx.status.clone(),
                            ctx.state.clone(),
                            cluster,
                        ),
                    }
                }
                None => {
                    // Workload deleted behind our back; drop the stale cache
                    // so the next pass takes the creation path.
                    ctx.state.cache_workload(key, None);
                }
            }
        }
        return Ok(());
    }

    if prior.is_some() {
        info!(%key, prior = prior.as_deref().unwrap_or_default(), new = %hash, "spec drift detected");
        ctx.metrics.drift_detected.inc();
    }
    ctx.status.write_phase(&cluster, Phase::Pending).await?;
    apply_supporting_objects(ctx, &cluster, key).await?;
    apply_workload(ctx, &cluster, key).await?;
    refresh_workload_cache(ctx, &sts_api, key).await?;
    write_applied_hash(ctx, &cluster, &hash).await?;
    readiness::spawn(
        ctx.client.clone(),
        ctx.status.clone(),
        ctx.state.clone(),
        cluster,
    );
    Ok(())
}

/// Applies everything except the workload, in a fixed order.
///
/// These are all cheap and idempotent: applying an unchanged manifest leaves
/// the object's generation alone.
async fn apply_supporting_objects(
    ctx: &Arc<Context>,
    cluster: &QdrantCluster,
    key: &Key,
) -> Result<()> {
    let namespace = &key.namespace;
    let name = &key.name;

    apply(ctx.client.clone(), namespace, &render::config_map(cluster, name)).await?;
    if let Some(secret) = render::read_api_key_secret(cluster, name) {
        apply(ctx.client.clone(), namespace, &secret).await?;
    }
    if let Some(secret) = render::api_key_secret(cluster, name) {
        apply(ctx.client.clone(), namespace, &secret).await?;
    }
    apply(ctx.client.clone(), namespace, &render::auth_secret(cluster, name)).await?;
    apply(ctx.client.clone(), namespace, &render::headless_service(cluster, name)).await?;
    apply(ctx.client.clone(), namespace, &render::client_service(cluster, name)).await?;
    apply(ctx.client.clone(), namespace, &render::disruption_budget(cluster, name)).await?;
    if let Some(cron) =
        render::snapshot_cron_job(cluster, namespace, name, ctx.job_image())
    {
        apply(ctx.client.clone(), namespace, &cron).await?;
    }
    Ok(())
}

async fn apply_workload(ctx: &Arc<Context>, cluster: &QdrantCluster, key: &Key) -> Result<()> {
    apply(
        ctx.client.clone(),
        &key.namespace,
        &render::stateful_set(cluster, &key.name),
    )
    .await
}

async fn refresh_workload_cache(
    ctx: &Arc<Context>,
    sts_api: &Api<StatefulSet>,
    key: &Key,
) -> Result<()> {
    let workload = sts_api.get_opt(&key.name).await?;
    ctx.state.cache_workload(key, workload);
    Ok(())
}

async fn write_applied_hash(ctx: &Arc<Context>, cluster: &QdrantCluster, hash: &str) -> Result<()> {
    let generation = cluster.metadata.generation;
    let hash = hash.to_string();
    ctx.status
        .update(cluster, move |status| {
            status.last_applied_hash = Some(hash);
            status.observed_generation = generation;
        })
        .await?;
    Ok(())
}

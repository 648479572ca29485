//! Collection reconciliation: an idempotent PUT against the hosting
//! cluster's HTTP surface, gated on that cluster being ready.

use std::sync::Arc;

use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::ResourceExt;
use qdrant_operator_api::{
    Phase, QdrantCluster, QdrantCollection, QdrantCollectionBackup, QdrantCollectionRestore,
    QdrantCollectionTemplate,
};
use serde_json::json;
use tracing::{debug, info, warn};

use super::{apply, Context, RETRY_DELAY};
use crate::error::Result;
use crate::qdrant::{collection_body, QdrantClient};
use crate::render;
use crate::state::{Operated as _, Request};

pub async fn reconcile(ctx: &Arc<Context>, request: &Request) -> Result<()> {
    let key = &request.key;
    let api: Api<QdrantCollection> = Api::namespaced(ctx.client.clone(), &key.namespace);

    // Always refetch: collection decisions run against the freshest spec,
    // not the cache.
    let Some(collection) = api.get_opt(&key.name).await? else {
        debug!(%key, "collection vanished before reconcile");
        return Ok(());
    };
    if collection.metadata.deletion_timestamp.is_some() {
        return Ok(());
    }

    // The hosting cluster must be answering HTTP before any collection call
    // can succeed; otherwise every request would burn its full timeout.
    let cluster_name = collection.spec.cluster.clone();
    let cluster_api: Api<QdrantCluster> = Api::namespaced(ctx.client.clone(), &key.namespace);
    let cluster = cluster_api.get_opt(&cluster_name).await?;
    let ready = cluster
        .as_ref()
        .and_then(QdrantCluster::phase)
        .is_some_and(Phase::is_ready);
    let Some(cluster) = cluster.filter(|_| ready) else {
        debug!(%key, cluster = %cluster_name, "hosting cluster not ready, retrying");
        ctx.status.write_phase(&collection, Phase::Pending).await?;
        ctx.schedule_retry(request.clone(), RETRY_DELAY);
        return Ok(());
    };

    // Fill unset fields from the referenced template, when there is one.
    let mut spec = collection.spec.clone();
    if let Some(template_name) = spec.template.clone() {
        let templates: Api<QdrantCollectionTemplate> =
            Api::namespaced(ctx.client.clone(), &key.namespace);
        match templates.get_opt(&template_name).await? {
            Some(template) => spec.inherit(&template.spec),
            None => warn!(%key, template = %template_name, "referenced template not found"),
        }
    }

    // PUT regardless of what the cache believes exists: the cache is not
    // authoritative, the cluster's answer is.
    let qdrant = QdrantClient::for_cluster(&cluster, &key.namespace, &cluster_name)?;
    let body = collection_body(&spec);
    match qdrant.ensure_collection(&key.name, &body).await {
        Ok(()) => {}
        Err(err) if err.is_transient() => {
            warn!(%key, error = %err, "transient collection failure, retrying");
            ctx.metrics
                .errors
                .with_label_values(&["qdrant_transient"])
                .inc();
            ctx.schedule_retry(request.clone(), RETRY_DELAY);
            return Ok(());
        }
        Err(err) => {
            ctx.status
                .write_error(&collection, "CollectionCreateFailed", &err.to_string())
                .await?;
            return Ok(());
        }
    }

    apply_ancillary_jobs(ctx, &collection, &cluster).await?;

    info!(%key, cluster = %cluster_name, "collection converged");
    ctx.status.write_phase(&collection, Phase::Healthy).await?;
    Ok(())
}

/// Scheduled snapshots plus any pending one-shot backup/restore resources
/// that target this collection.
async fn apply_ancillary_jobs(
    ctx: &Arc<Context>,
    collection: &QdrantCollection,
    cluster: &QdrantCluster,
) -> Result<()> {
    let namespace = collection.namespace().unwrap_or_default();
    let name = collection.name_any();
    let image = ctx.job_image();

    if let Some(cron) = render::collection_snapshot_cron_job(collection, cluster, &namespace, image)
    {
        apply(ctx.client.clone(), &namespace, &cron).await?;
    }

    let backups: Api<QdrantCollectionBackup> = Api::namespaced(ctx.client.clone(), &namespace);
    for backup in backups.list(&ListParams::default()).await?.items {
        if backup.spec.collection != name
            || backup.status.as_ref().is_some_and(|s| s.job_name.is_some())
        {
            continue;
        }
        if let Some(job) = render::backup_job(&backup, cluster, &namespace, image) {
            let job_name = job.metadata.name.clone().unwrap_or_default();
            apply(ctx.client.clone(), &namespace, &job).await?;
            mark_job_spawned(&backups, &backup.name_any(), &job_name).await?;
        }
    }

    let restores: Api<QdrantCollectionRestore> = Api::namespaced(ctx.client.clone(), &namespace);
    for restore in restores.list(&ListParams::default()).await?.items {
        if restore.spec.collection != name
            || restore.status.as_ref().is_some_and(|s| s.job_name.is_some())
        {
            continue;
        }
        if let Some(job) = render::restore_job(&restore, cluster, &namespace, image) {
            let job_name = job.metadata.name.clone().unwrap_or_default();
            apply(ctx.client.clone(), &namespace, &job).await?;
            mark_job_spawned(&restores, &restore.name_any(), &job_name).await?;
        }
    }

    Ok(())
}

/// Records the spawned job on the one-shot resource so it is not re-spawned
/// by the next reconcile.
async fn mark_job_spawned<K>(api: &Api<K>, name: &str, job_name: &str) -> Result<()>
where
    K: kube::Resource + Clone + serde::de::DeserializeOwned + std::fmt::Debug,
{
    let patch = json!({"status": {"jobName": job_name}});
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

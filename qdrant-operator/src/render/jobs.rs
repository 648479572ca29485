//! Snapshot, backup and restore jobs.
//!
//! These run as ordinary Jobs/CronJobs hitting the cluster's snapshot API
//! from inside the namespace, so they work regardless of the service type.

use k8s_openapi::api::batch::v1::{CronJob, CronJobSpec, Job, JobSpec, JobTemplateSpec};
use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use qdrant_operator_api::{
    QdrantCluster, QdrantCollection, QdrantCollectionBackup, QdrantCollectionRestore,
};

use super::{child_meta, labels, names};
use crate::qdrant::endpoint_for;

/// Image used when the operator has no explicit job image configured.
pub const DEFAULT_JOB_IMAGE: &str = "curlimages/curl:8.13.0";

fn curl_container(cluster: &QdrantCluster, image: &str, args: Vec<String>) -> Container {
    let mut env = Vec::new();
    if let Some(key) = cluster.spec.api_key() {
        env.push(EnvVar {
            name: "QDRANT_API_KEY".to_string(),
            value: Some(key.to_string()),
            ..EnvVar::default()
        });
    }
    Container {
        name: "snapshot".to_string(),
        image: Some(image.to_string()),
        command: Some(vec!["sh".to_string(), "-c".to_string()]),
        args: Some(args),
        env: Some(env),
        ..Container::default()
    }
}

fn one_shot_pod(cluster: &QdrantCluster, instance: &str, image: &str, script: String) -> PodTemplateSpec {
    PodTemplateSpec {
        metadata: Some(ObjectMeta {
            labels: Some(labels(instance)),
            ..ObjectMeta::default()
        }),
        spec: Some(PodSpec {
            restart_policy: Some("OnFailure".to_string()),
            containers: vec![curl_container(cluster, image, vec![script])],
            ..PodSpec::default()
        }),
    }
}

fn curl(url: &str, method: &str) -> String {
    // -k: in-cluster certs are commonly self-signed, see the qdrant client.
    format!("curl -fsSk -X {method} -H \"api-key: ${{QDRANT_API_KEY}}\" \"{url}\"")
}

/// CronJob taking a full-cluster snapshot on the configured schedule.
///
/// Returns `None` when the cluster has no snapshot schedule.
pub fn snapshot_cron_job(
    cluster: &QdrantCluster,
    namespace: &str,
    name: &str,
    image: &str,
) -> Option<CronJob> {
    let snapshots = cluster.spec.snapshots.as_ref()?;
    let endpoint = endpoint_for(cluster, namespace, name);
    Some(CronJob {
        metadata: child_meta(cluster, names::snapshot_cron(name)),
        spec: Some(CronJobSpec {
            schedule: snapshots.schedule.clone(),
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                spec: Some(JobSpec {
                    template: one_shot_pod(
                        cluster,
                        name,
                        image,
                        curl(&format!("{endpoint}/snapshots"), "POST"),
                    ),
                    ..JobSpec::default()
                }),
                ..JobTemplateSpec::default()
            },
            ..CronJobSpec::default()
        }),
        ..CronJob::default()
    })
}

/// CronJob snapshotting a single collection on its own schedule.
pub fn collection_snapshot_cron_job(
    collection: &QdrantCollection,
    cluster: &QdrantCluster,
    namespace: &str,
    image: &str,
) -> Option<CronJob> {
    let snapshots = collection.spec.snapshots.as_ref()?;
    let collection_name = collection.metadata.name.as_deref()?;
    let endpoint = endpoint_for(cluster, namespace, &collection.spec.cluster);
    Some(CronJob {
        metadata: child_meta(collection, names::snapshot_cron(collection_name)),
        spec: Some(CronJobSpec {
            schedule: snapshots.schedule.clone(),
            concurrency_policy: Some("Forbid".to_string()),
            job_template: JobTemplateSpec {
                spec: Some(JobSpec {
                    template: one_shot_pod(
                        cluster,
                        collection_name,
                        image,
                        curl(
                            &format!("{endpoint}/collections/{collection_name}/snapshots"),
                            "POST",
                        ),
                    ),
                    ..JobSpec::default()
                }),
                ..JobTemplateSpec::default()
            },
            ..CronJobSpec::default()
        }),
        ..CronJob::default()
    })
}

/// One-shot job snapshotting a collection for a `QdrantCollectionBackup`.
pub fn backup_job(
    backup: &QdrantCollectionBackup,
    cluster: &QdrantCluster,
    namespace: &str,
    image: &str,
) -> Option<Job> {
    let backup_name = backup.metadata.name.as_deref()?;
    let endpoint = endpoint_for(cluster, namespace, &backup.spec.cluster);
    let collection = &backup.spec.collection;
    Some(Job {
        metadata: child_meta(backup, format!("{backup_name}-backup")),
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            template: one_shot_pod(
                cluster,
                collection,
                image,
                curl(&format!("{endpoint}/collections/{collection}/snapshots"), "POST"),
            ),
            ..JobSpec::default()
        }),
        ..Job::default()
    })
}

/// One-shot job recovering a collection from a snapshot for a
/// `QdrantCollectionRestore`.
pub fn restore_job(
    restore: &QdrantCollectionRestore,
    cluster: &QdrantCluster,
    namespace: &str,
    image: &str,
) -> Option<Job> {
    let restore_name = restore.metadata.name.as_deref()?;
    let endpoint = endpoint_for(cluster, namespace, &restore.spec.cluster);
    let collection = &restore.spec.collection;
    let location = restore
        .spec
        .snapshot_url
        .clone()
        .or_else(|| restore.spec.snapshot_name.clone())?;
    let script = format!(
        "curl -fsSk -X PUT -H \"api-key: ${{QDRANT_API_KEY}}\" \
         -H 'Content-Type: application/json' \
         -d '{{\"location\": \"{location}\"}}' \
         \"{endpoint}/collections/{collection}/snapshots/recover\""
    );
    Some(Job {
        metadata: child_meta(restore, format!("{restore_name}-restore")),
        spec: Some(JobSpec {
            backoff_limit: Some(3),
            template: one_shot_pod(cluster, collection, image, script),
            ..JobSpec::default()
        }),
        ..Job::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster() -> QdrantCluster {
        serde_json::from_value(serde_json::json!({
            "apiVersion": "qdrant.operator/v1alpha1",
            "kind": "QdrantCluster",
            "metadata": {"name": "main", "namespace": "vectors", "uid": "u-1"},
            "spec": {
                "replicas": 1,
                "image": "qdrant/qdrant:v1.16.3",
                "apikey": "rw",
                "snapshots": {"schedule": "0 3 * * *", "retentionCount": 5},
            },
        }))
        .unwrap()
    }

    #[test]
    fn cluster_snapshot_cron_follows_the_schedule() {
        let cron = snapshot_cron_job(&cluster(), "vectors", "main", DEFAULT_JOB_IMAGE).unwrap();
        assert_eq!(cron.metadata.name.as_deref(), Some("main-snapshots"));
        let spec = cron.spec.unwrap();
        assert_eq!(spec.schedule, "0 3 * * *");
        let pod = spec.job_template.spec.unwrap().template.spec.unwrap();
        let script = &pod.containers[0].args.as_ref().unwrap()[0];
        assert!(script.contains("http://main.vectors.svc:6333/snapshots"));
    }

    #[test]
    fn no_schedule_means_no_cron() {
        let mut cluster = cluster();
        cluster.spec.snapshots = None;
        assert!(snapshot_cron_job(&cluster, "vectors", "main", DEFAULT_JOB_IMAGE).is_none());
    }

    #[test]
    fn restore_job_prefers_the_url_location() {
        let restore: QdrantCollectionRestore = serde_json::from_value(serde_json::json!({
            "apiVersion": "qdrant.operator/v1alpha1",
            "kind": "QdrantCollectionRestore",
            "metadata": {"name": "docs-restore", "namespace": "vectors", "uid": "u-2"},
            "spec": {
                "cluster": "main",
                "collection": "docs",
                "snapshotName": "snap-1",
                "snapshotUrl": "https://bucket/snap-1.tar",
            },
        }))
        .unwrap();
        let job = restore_job(&restore, &cluster(), "vectors", DEFAULT_JOB_IMAGE).unwrap();
        let pod = job.spec.unwrap().template.spec.unwrap();
        let script = &pod.containers[0].args.as_ref().unwrap()[0];
        assert!(script.contains("https://bucket/snap-1.tar"));
        assert!(script.contains("/collections/docs/snapshots/recover"));
    }
}

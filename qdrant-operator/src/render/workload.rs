//! The stateful workload running qdrant itself.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{StatefulSet, StatefulSetSpec};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, HTTPGetAction, PersistentVolumeClaim,
    PersistentVolumeClaimSpec, PodSpec, PodTemplateSpec, Probe, SecretVolumeSource, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use qdrant_operator_api::QdrantCluster;

use super::configmap::GRPC_PORT;
use super::{child_meta, labels, names};
use crate::qdrant::QDRANT_PORT;

const STORAGE_VOLUME: &str = "qdrant-storage";
const CONFIG_VOLUME: &str = "qdrant-config";
const AUTH_VOLUME: &str = "qdrant-auth";
const TLS_VOLUME: &str = "qdrant-tls";

/// Renders the StatefulSet for a cluster.
///
/// The pod template only depends on the fingerprinted spec subset plus the
/// pass-through scheduling fields, so an unchanged spec renders an identical
/// template and server-side apply leaves the object's generation alone.
pub fn stateful_set(cluster: &QdrantCluster, name: &str) -> StatefulSet {
    let spec = &cluster.spec;

    let mut volume_mounts = vec![
        VolumeMount {
            name: STORAGE_VOLUME.to_string(),
            mount_path: "/qdrant/storage".to_string(),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: CONFIG_VOLUME.to_string(),
            mount_path: "/qdrant/config".to_string(),
            ..VolumeMount::default()
        },
        VolumeMount {
            name: AUTH_VOLUME.to_string(),
            mount_path: "/qdrant/config/local.yaml".to_string(),
            sub_path: Some("local.yaml".to_string()),
            ..VolumeMount::default()
        },
    ];

    let mut volumes = vec![
        Volume {
            name: CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: names::config(name),
                ..ConfigMapVolumeSource::default()
            }),
            ..Volume::default()
        },
        Volume {
            name: AUTH_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: Some(names::auth_secret(name)),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        },
    ];

    if let Some(tls) = spec.tls.as_ref().filter(|tls| tls.enabled) {
        volume_mounts.push(VolumeMount {
            name: TLS_VOLUME.to_string(),
            mount_path: "/qdrant/tls".to_string(),
            read_only: Some(true),
            ..VolumeMount::default()
        });
        volumes.push(Volume {
            name: TLS_VOLUME.to_string(),
            secret: Some(SecretVolumeSource {
                secret_name: tls.secret_name.clone(),
                ..SecretVolumeSource::default()
            }),
            ..Volume::default()
        });
    }
    volumes.extend(spec.additional_volumes.iter().cloned());

    // Without persistence the data lives in an emptyDir and dies with the pod.
    let volume_claim_templates = match &spec.persistence {
        Some(persistence) => Some(vec![PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(STORAGE_VOLUME.to_string()),
                ..ObjectMeta::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: Some(vec!["ReadWriteOnce".to_string()]),
                storage_class_name: persistence.storage_class_name.clone(),
                resources: Some(VolumeResourceRequirements {
                    requests: Some(BTreeMap::from([(
                        "storage".to_string(),
                        Quantity(persistence.size.clone()),
                    )])),
                    ..VolumeResourceRequirements::default()
                }),
                ..PersistentVolumeClaimSpec::default()
            }),
            ..PersistentVolumeClaim::default()
        }]),
        None => {
            volumes.push(Volume {
                name: STORAGE_VOLUME.to_string(),
                empty_dir: Some(Default::default()),
                ..Volume::default()
            });
            None
        }
    };

    let probe_scheme = if spec.tls_enabled() { Some("HTTPS".to_string()) } else { None };
    let probe = |path: &str, initial: i32| Probe {
        http_get: Some(HTTPGetAction {
            path: Some(path.to_string()),
            port: IntOrString::Int(i32::from(QDRANT_PORT)),
            scheme: probe_scheme.clone(),
            ..HTTPGetAction::default()
        }),
        initial_delay_seconds: Some(initial),
        period_seconds: Some(5),
        ..Probe::default()
    };

    let mut containers = vec![Container {
        name: "qdrant".to_string(),
        image: Some(spec.image.clone()),
        ports: Some(vec![
            ContainerPort {
                name: Some("http".to_string()),
                container_port: i32::from(QDRANT_PORT),
                ..ContainerPort::default()
            },
            ContainerPort {
                name: Some("grpc".to_string()),
                container_port: i32::from(GRPC_PORT),
                ..ContainerPort::default()
            },
        ]),
        volume_mounts: Some(volume_mounts),
        readiness_probe: Some(probe("/readyz", 5)),
        liveness_probe: Some(probe("/livez", 10)),
        resources: spec.resources.clone(),
        ..Container::default()
    }];
    containers.extend(spec.sidecar_containers.iter().cloned());

    let placement = spec.placement.clone().unwrap_or_default();

    StatefulSet {
        metadata: child_meta(cluster, names::workload(name)),
        spec: Some(StatefulSetSpec {
            replicas: Some(spec.replicas),
            service_name: Some(names::headless_service(name)),
            selector: LabelSelector {
                match_labels: Some(labels(name)),
                ..LabelSelector::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels(name)),
                    ..ObjectMeta::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    volumes: Some(volumes),
                    affinity: placement.affinity,
                    tolerations: if placement.tolerations.is_empty() {
                        None
                    } else {
                        Some(placement.tolerations)
                    },
                    topology_spread_constraints: if placement.topology_spread_constraints.is_empty()
                    {
                        None
                    } else {
                        Some(placement.topology_spread_constraints)
                    },
                    ..PodSpec::default()
                }),
            },
            volume_claim_templates,
            ..StatefulSetSpec::default()
        }),
        ..StatefulSet::default()
    }
}

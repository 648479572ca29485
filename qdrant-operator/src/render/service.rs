//! Services and the disruption budget in front of the workload.

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use qdrant_operator_api::QdrantCluster;

use super::configmap::GRPC_PORT;
use super::{child_meta, labels, names};
use crate::qdrant::QDRANT_PORT;

fn ports() -> Vec<ServicePort> {
    vec![
        ServicePort {
            name: Some("http".to_string()),
            port: i32::from(QDRANT_PORT),
            target_port: Some(IntOrString::Int(i32::from(QDRANT_PORT))),
            ..ServicePort::default()
        },
        ServicePort {
            name: Some("grpc".to_string()),
            port: i32::from(GRPC_PORT),
            target_port: Some(IntOrString::Int(i32::from(GRPC_PORT))),
            ..ServicePort::default()
        },
    ]
}

/// Headless service giving each replica a stable DNS identity.
///
/// Not-ready addresses are published so replicas can find each other while
/// the set is still rolling out.
pub fn headless_service(cluster: &QdrantCluster, name: &str) -> Service {
    Service {
        metadata: child_meta(cluster, names::headless_service(name)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            publish_not_ready_addresses: Some(true),
            selector: Some(labels(name)),
            ports: Some(ports()),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Client-facing service, typed per `spec.service`.
pub fn client_service(cluster: &QdrantCluster, name: &str) -> Service {
    Service {
        metadata: child_meta(cluster, names::client_service(name)),
        spec: Some(ServiceSpec {
            type_: Some(cluster.spec.service_kind().as_str().to_string()),
            selector: Some(labels(name)),
            ports: Some(ports()),
            ..ServiceSpec::default()
        }),
        ..Service::default()
    }
}

/// Allows at most one replica to be voluntarily disrupted at a time.
pub fn disruption_budget(cluster: &QdrantCluster, name: &str) -> PodDisruptionBudget {
    PodDisruptionBudget {
        metadata: child_meta(cluster, names::disruption_budget(name)),
        spec: Some(PodDisruptionBudgetSpec {
            max_unavailable: Some(IntOrString::Int(1)),
            selector: Some(LabelSelector {
                match_labels: Some(labels(name)),
                ..LabelSelector::default()
            }),
            ..PodDisruptionBudgetSpec::default()
        }),
        ..PodDisruptionBudget::default()
    }
}

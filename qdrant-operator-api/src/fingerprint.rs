//! Spec fingerprinting for fast drift detection.
//!
//! The fingerprint covers exactly the subset of a cluster spec that affects
//! the rendered workload. Fields that only feed cheap, idempotent resources
//! (snapshot schedules, scheduling hints, extra volumes) are excluded so that
//! editing them never triggers a rollout.

use sha2::{Digest, Sha256};

use crate::cluster::QdrantClusterSpec;

/// Number of hex characters kept from the digest.
const FINGERPRINT_LEN: usize = 16;

/// Computes the 16-hex-character fingerprint of the rollout-relevant spec
/// subset.
///
/// The subset is serialized through `serde_json::Value`, whose object keys
/// are ordered, so two specs that agree on the subset always hash equal
/// regardless of input field order.
#[must_use]
pub fn fingerprint(spec: &QdrantClusterSpec) -> String {
    let canonical = serde_json::json!({
        "apikey": spec.apikey,
        "image": spec.image,
        "persistence": spec.persistence,
        "readApikey": spec.read_apikey,
        "replicas": spec.replicas,
        "resources": spec.resources,
        "service": spec.service_kind(),
        "tls": spec.tls,
    });
    let digest = Sha256::digest(canonical.to_string().as_bytes());
    hex::encode(digest)[..FINGERPRINT_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::{PersistenceSpec, ServiceKind, SnapshotSpec};

    fn spec() -> QdrantClusterSpec {
        serde_json::from_value(serde_json::json!({
            "replicas": 3,
            "image": "qdrant/qdrant:v1.16.3",
            "apikey": "s3cret",
            "persistence": {"size": "10Gi"},
        }))
        .unwrap()
    }

    #[test]
    fn is_sixteen_hex_chars() {
        let hash = fingerprint(&spec());
        assert_eq!(hash.len(), 16);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn equal_specs_hash_equal() {
        assert_eq!(fingerprint(&spec()), fingerprint(&spec()));
    }

    #[test]
    fn every_covered_field_changes_the_hash() {
        let base = fingerprint(&spec());

        let mut changed = spec();
        changed.replicas = 4;
        assert_ne!(fingerprint(&changed), base);

        let mut changed = spec();
        changed.image = "qdrant/qdrant:v1.17.0".into();
        assert_ne!(fingerprint(&changed), base);

        let mut changed = spec();
        changed.apikey = None;
        assert_ne!(fingerprint(&changed), base);

        let mut changed = spec();
        changed.read_apikey = Some("ro".into());
        assert_ne!(fingerprint(&changed), base);

        let mut changed = spec();
        changed.tls = Some(crate::cluster::TlsSpec {
            enabled: true,
            secret_name: None,
        });
        assert_ne!(fingerprint(&changed), base);

        let mut changed = spec();
        changed.persistence = Some(PersistenceSpec {
            size: "20Gi".into(),
            storage_class_name: None,
        });
        assert_ne!(fingerprint(&changed), base);

        let mut changed = spec();
        changed.service = Some(ServiceKind::NodePort);
        assert_ne!(fingerprint(&changed), base);
    }

    #[test]
    fn uncovered_fields_do_not_change_the_hash() {
        let base = fingerprint(&spec());
        let mut changed = spec();
        changed.snapshots = Some(SnapshotSpec {
            schedule: "0 3 * * *".into(),
            retention_count: Some(5),
        });
        assert_eq!(fingerprint(&changed), base);
    }

    #[test]
    fn default_service_kind_hashes_like_explicit_cluster_ip() {
        let base = fingerprint(&spec());
        let mut changed = spec();
        changed.service = Some(ServiceKind::ClusterIP);
        assert_eq!(fingerprint(&changed), base);
    }
}

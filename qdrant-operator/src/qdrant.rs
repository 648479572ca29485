//! HTTP client for the collection surface of a running cluster.
//!
//! Collections are managed with PUT/PATCH/DELETE against
//! `/collections/{name}` on the cluster's client service. All writes are
//! idempotent: PUT succeeds if the collection already exists with the same
//! shape, DELETE succeeds if it is already gone.

use std::error::Error as _;
use std::time::Duration;

use qdrant_operator_api::{QdrantCluster, QdrantCollectionSpec};
use serde_json::json;
use thiserror::Error;
use tracing::debug;

/// Collection endpoint port on every cluster.
pub const QDRANT_PORT: u16 = 6333;
/// Hard cap on any single request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum Error {
    #[error("request timed out after {REQUEST_TIMEOUT:?}")]
    Timeout,
    #[error("dns lookup for the cluster endpoint failed")]
    DnsNotFound,
    #[error("cluster endpoint refused the connection")]
    ConnectionRefused,
    #[error("transport error: {0}")]
    Transport(#[source] reqwest::Error),
    #[error("cluster returned {code}: {message}")]
    Api { code: u16, message: String },
    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),
}

impl Error {
    /// Transient failures are retried by the reconciler; permanent ones
    /// surface as an `Error` status.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Timeout
            | Error::DnsNotFound
            | Error::ConnectionRefused
            | Error::Transport(_) => true,
            Error::Api { code, .. } => *code == 429 || *code >= 500,
            Error::Build(_) => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Client bound to one cluster's endpoint.
#[derive(Clone)]
pub struct QdrantClient {
    http: reqwest::Client,
    base: String,
    api_key: Option<String>,
}

/// In-cluster service DNS name for a cluster's collection endpoint.
#[must_use]
pub fn endpoint_for(cluster: &QdrantCluster, namespace: &str, name: &str) -> String {
    let scheme = if cluster.spec.tls_enabled() { "https" } else { "http" };
    format!("{scheme}://{name}.{namespace}.svc:{QDRANT_PORT}")
}

/// Builds the idempotent create/update request body for a collection.
#[must_use]
pub fn collection_body(spec: &QdrantCollectionSpec) -> serde_json::Value {
    let mut body = json!({
        "vectors": {
            "size": spec.vector_size,
            "distance": "Cosine",
            "on_disk": spec.on_disk,
        },
        "shard_number": spec.shard_number.unwrap_or(1),
        "replication_factor": spec.replication_factor.unwrap_or(1),
    });
    if let Some(serde_json::Value::Object(extra)) = spec.config.clone() {
        if let Some(body_map) = body.as_object_mut() {
            for (key, value) in extra {
                body_map.entry(key).or_insert(value);
            }
        }
    }
    body
}

impl QdrantClient {
    pub fn new(base: String, api_key: Option<String>, accept_invalid_certs: bool) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            // Clusters terminate TLS with certificates issued for their
            // service name, often self-signed; verification is the job of
            // the secret that provisioned them.
            .danger_accept_invalid_certs(accept_invalid_certs)
            .build()
            .map_err(Error::Build)?;
        Ok(Self { http, base, api_key })
    }

    /// Client for a cluster, addressed through its client service.
    pub fn for_cluster(cluster: &QdrantCluster, namespace: &str, name: &str) -> Result<Self> {
        Self::new(
            endpoint_for(cluster, namespace, name),
            cluster.spec.api_key().map(String::from),
            cluster.spec.tls_enabled(),
        )
    }

    /// PUT semantics: creates the collection if absent, succeeds if present.
    pub async fn ensure_collection(&self, name: &str, body: &serde_json::Value) -> Result<()> {
        let request = self.http.put(self.url(name)).json(body);
        self.send(request).await
    }

    /// Updates parameters of an existing collection.
    pub async fn update_collection(&self, name: &str, body: &serde_json::Value) -> Result<()> {
        let request = self.http.patch(self.url(name)).json(body);
        self.send(request).await
    }

    /// Deletes the collection. Already-absent collections are a success.
    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        let request = self.http.delete(self.url(name));
        match self.send(request).await {
            Err(Error::Api { code: 404, .. }) => Ok(()),
            other => other,
        }
    }

    fn url(&self, collection: &str) -> String {
        format!("{}/collections/{collection}", self.base)
    }

    async fn send(&self, mut request: reqwest::RequestBuilder) -> Result<()> {
        if let Some(key) = &self.api_key {
            request = request.header("api-key", key);
        }
        let response = request.send().await.map_err(classify)?;
        let code = response.status();
        if code.is_success() {
            debug!(%code, "qdrant request ok");
            return Ok(());
        }
        let message = match response.json::<serde_json::Value>().await {
            Ok(body) => body
                .pointer("/status/error")
                .and_then(serde_json::Value::as_str)
                .unwrap_or("unknown error")
                .to_string(),
            Err(_) => "unreadable error body".to_string(),
        };
        Err(Error::Api {
            code: code.as_u16(),
            message,
        })
    }
}

fn classify(err: reqwest::Error) -> Error {
    if err.is_timeout() {
        return Error::Timeout;
    }
    if err.is_connect() {
        let mut source = err.source();
        while let Some(cause) = source {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                if io.kind() == std::io::ErrorKind::ConnectionRefused {
                    return Error::ConnectionRefused;
                }
            }
            if cause.to_string().contains("dns error") {
                return Error::DnsNotFound;
            }
            source = cause.source();
        }
    }
    Error::Transport(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(tls: bool) -> QdrantCluster {
        serde_json::from_value(json!({
            "apiVersion": "qdrant.operator/v1alpha1",
            "kind": "QdrantCluster",
            "metadata": {"name": "main", "namespace": "vectors"},
            "spec": {
                "replicas": 1,
                "image": "qdrant/qdrant:v1.16.3",
                "tls": {"enabled": tls},
            },
        }))
        .unwrap()
    }

    fn collection_spec(value: serde_json::Value) -> QdrantCollectionSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn endpoint_follows_tls_setting() {
        assert_eq!(
            endpoint_for(&cluster(false), "vectors", "main"),
            "http://main.vectors.svc:6333"
        );
        assert_eq!(
            endpoint_for(&cluster(true), "vectors", "main"),
            "https://main.vectors.svc:6333"
        );
    }

    #[test]
    fn body_defaults_shards_and_replication_to_one() {
        let body = collection_body(&collection_spec(json!({
            "cluster": "main",
            "vectorSize": 384,
        })));
        assert_eq!(body["vectors"]["size"], 384);
        assert_eq!(body["vectors"]["distance"], "Cosine");
        assert_eq!(body["shard_number"], 1);
        assert_eq!(body["replication_factor"], 1);
    }

    #[test]
    fn extra_config_merges_without_clobbering_core_fields() {
        let body = collection_body(&collection_spec(json!({
            "cluster": "main",
            "vectorSize": 384,
            "shardNumber": 2,
            "config": {
                "hnsw_config": {"m": 24},
                "shard_number": 99,
            },
        })));
        assert_eq!(body["shard_number"], 2);
        assert_eq!(body["hnsw_config"]["m"], 24);
    }

    #[test]
    fn transience_follows_the_error_taxonomy() {
        assert!(Error::Timeout.is_transient());
        assert!(Error::ConnectionRefused.is_transient());
        assert!(Error::Api { code: 503, message: String::new() }.is_transient());
        assert!(!Error::Api { code: 400, message: String::new() }.is_transient());
    }
}

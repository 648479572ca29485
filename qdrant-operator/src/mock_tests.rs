//! Scenario tests against a mocked API server.
//!
//! Each test runs one scenario: a scripted sequence of expected requests
//! with canned responses, driven through a `tower_test` mock service that
//! the kube client talks to. If the code under test makes a call the
//! scenario does not expect, the test fails on the channel closing; if it
//! makes fewer, the timeout on the scenario join handle catches it.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures::stream;
use http::{Request, Response};
use http_body_util::BodyExt;
use kube::client::Body;
use kube::Client;
use qdrant_operator_api::{fingerprint, Phase, QdrantCluster};
use serde_json::json;
use tokio::sync::mpsc;

use crate::cleanup;
use crate::metrics::Metrics;
use crate::queue::Enqueue;
use crate::reconcile::{self, Context};
use crate::router::Router;
use crate::state::{ControlState, Key, Request as WorkRequest, ResourceKind};
use crate::status::StatusWriter;
use crate::watcher::Event;

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;

struct ApiServerVerifier(ApiServerHandle);

fn testcontext() -> (Client, ApiServerVerifier) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let client = Client::new(mock_service, "default");
    (client, ApiServerVerifier(handle))
}

fn operator_context(
    client: Client,
) -> (Arc<Context>, mpsc::UnboundedReceiver<Enqueue>) {
    let state = Arc::new(ControlState::default());
    let status = StatusWriter::new(client.clone(), state.clone());
    let (sched_tx, sched_rx) = mpsc::unbounded_channel();
    let ctx = Arc::new(Context {
        client,
        state,
        status,
        metrics: Arc::new(Metrics::new().unwrap()),
        settings: crate::config::Settings {
            pod_name: "qdrant-operator-0".to_string(),
            pod_namespace: "default".to_string(),
            debug: false,
            metrics_port: 0,
            job_image: None,
        },
        sched_tx,
    });
    (ctx, sched_rx)
}

async fn timeout_after_5s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("timeout waiting on the mock apiserver scenario")
        .expect("scenario completed");
}

fn cluster_json(name: &str, resource_version: &str, replicas: i64, image: &str) -> serde_json::Value {
    json!({
        "apiVersion": "qdrant.operator/v1alpha1",
        "kind": "QdrantCluster",
        "metadata": {
            "name": name,
            "namespace": "default",
            "uid": "uid-1",
            "resourceVersion": resource_version,
            "generation": 1,
            "finalizers": ["qdrant.operator/finalizer"],
        },
        "spec": {"replicas": replicas, "image": image},
    })
}

fn cluster(value: serde_json::Value) -> QdrantCluster {
    serde_json::from_value(value).unwrap()
}

fn status_json(code: u16, reason: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "kind": "Status",
        "apiVersion": "v1",
        "status": "Failure",
        "message": reason,
        "reason": reason,
        "code": code,
    }))
    .unwrap()
}

fn ok_body(value: &serde_json::Value) -> Body {
    Body::from(serde_json::to_vec(value).unwrap())
}

fn error_response(code: u16, reason: &str) -> Response<Body> {
    Response::builder()
        .status(code)
        .body(Body::from(status_json(code, reason)))
        .unwrap()
}

enum Scenario {
    /// Invalid spec: one error status write, nothing else.
    InvalidSpecStatus,
    /// Valid object without our finalizer: one merge patch attaching it.
    FinalizerAttach,
    /// No calls at all are expected.
    RadioSilence,
    /// Status patch answers 404 twice, then succeeds.
    StatusNotFoundRetry,
    /// Status patch conflicts, writer refetches and replaces.
    StatusConflictReplace,
    /// Full creation pass for a cluster with no workload.
    ClusterCreation { hash: String },
    /// No-drift pass: only the cheap resources are re-applied.
    ClusterNoDrift,
    /// Cleanup with the workload already gone.
    CleanupAbsentWorkload,
}

impl ApiServerVerifier {
    fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match scenario {
                Scenario::InvalidSpecStatus => self.handle_invalid_spec_status().await,
                Scenario::FinalizerAttach => self.handle_finalizer_attach().await,
                Scenario::RadioSilence => Ok(self),
                Scenario::StatusNotFoundRetry => self.handle_status_not_found_retry().await,
                Scenario::StatusConflictReplace => self.handle_status_conflict_replace().await,
                Scenario::ClusterCreation { hash } => self.handle_cluster_creation(hash).await,
                Scenario::ClusterNoDrift => self.handle_cheap_applies().await,
                Scenario::CleanupAbsentWorkload => self.handle_cleanup_absent_workload().await,
            }
            .expect("scenario completed without errors");
        })
    }

    async fn expect(
        mut self,
        method: &http::Method,
        path: &str,
        response: Response<Body>,
    ) -> Result<(Self, serde_json::Value)> {
        let (request, send) = self
            .0
            .next_request()
            .await
            .ok_or_else(|| anyhow::anyhow!("expected a request to {path}, got none"))?;
        assert_eq!(request.method(), method, "method mismatch for {path}");
        assert_eq!(
            request.uri().path(),
            path,
            "path mismatch (query was {:?})",
            request.uri().query()
        );
        let bytes = request.into_body().collect().await?.to_bytes();
        let body = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes)?
        };
        send.send_response(response);
        Ok((self, body))
    }

    async fn handle_invalid_spec_status(self) -> Result<Self> {
        let (this, body) = self
            .expect(
                &http::Method::PATCH,
                "/apis/qdrant.operator/v1alpha1/namespaces/default/qdrantclusters/bad/status",
                Response::builder()
                    .body(ok_body(&cluster_json("bad", "2", 0, "qdrant/qdrant:v1.16.3")))
                    .unwrap(),
            )
            .await?;
        assert_eq!(body["status"]["qdrantStatus"], "Error");
        assert_eq!(body["status"]["reason"], "InvalidSpec");
        assert!(body["status"]["errorMessage"]
            .as_str()
            .unwrap()
            .contains("replicas"));
        assert_eq!(body["status"]["conditions"][0]["status"], "False");
        Ok(this)
    }

    async fn handle_finalizer_attach(self) -> Result<Self> {
        let (this, body) = self
            .expect(
                &http::Method::PATCH,
                "/apis/qdrant.operator/v1alpha1/namespaces/default/qdrantclusters/fresh",
                Response::builder()
                    .body(ok_body(&cluster_json("fresh", "2", 1, "qdrant/qdrant:v1.16.3")))
                    .unwrap(),
            )
            .await?;
        let finalizers = body["metadata"]["finalizers"].as_array().unwrap();
        assert!(finalizers.contains(&json!("qdrant.operator/finalizer")));
        Ok(this)
    }

    async fn handle_status_not_found_retry(self) -> Result<Self> {
        let path = "/apis/qdrant.operator/v1alpha1/namespaces/default/qdrantclusters/main/status";
        let this = self
            .expect(&http::Method::PATCH, path, error_response(404, "NotFound"))
            .await?
            .0;
        let this = this
            .expect(&http::Method::PATCH, path, error_response(404, "NotFound"))
            .await?
            .0;
        let (this, body) = this
            .expect(
                &http::Method::PATCH,
                path,
                Response::builder()
                    .body(ok_body(&cluster_json("main", "3", 1, "qdrant/qdrant:v1.16.3")))
                    .unwrap(),
            )
            .await?;
        assert_eq!(body["status"]["qdrantStatus"], "Pending");
        Ok(this)
    }

    async fn handle_status_conflict_replace(self) -> Result<Self> {
        let status_path =
            "/apis/qdrant.operator/v1alpha1/namespaces/default/qdrantclusters/main/status";
        let object_path = "/apis/qdrant.operator/v1alpha1/namespaces/default/qdrantclusters/main";
        let this = self
            .expect(&http::Method::PATCH, status_path, error_response(409, "Conflict"))
            .await?
            .0;
        let this = this
            .expect(
                &http::Method::GET,
                object_path,
                Response::builder()
                    .body(ok_body(&cluster_json("main", "7", 1, "qdrant/qdrant:v1.16.3")))
                    .unwrap(),
            )
            .await?
            .0;
        let (this, body) = this
            .expect(
                &http::Method::PUT,
                status_path,
                Response::builder()
                    .body(ok_body(&cluster_json("main", "8", 1, "qdrant/qdrant:v1.16.3")))
                    .unwrap(),
            )
            .await?;
        // The replace carries the refetched resourceVersion so the apiserver
        // can reject us again on a real race.
        assert_eq!(body["metadata"]["resourceVersion"], "7");
        assert_eq!(body["status"]["qdrantStatus"], "Pending");
        Ok(this)
    }

    async fn handle_cluster_creation(self, hash: String) -> Result<Self> {
        let sts_path = "/apis/apps/v1/namespaces/default/statefulsets/main";
        let status_path =
            "/apis/qdrant.operator/v1alpha1/namespaces/default/qdrantclusters/main/status";
        let cluster_body = cluster_json("main", "1", 1, "qdrant/qdrant:v1.16.3");
        let sts_body = json!({
            "apiVersion": "apps/v1",
            "kind": "StatefulSet",
            "metadata": {"name": "main", "namespace": "default", "resourceVersion": "10"},
            "spec": {"replicas": 1, "selector": {}, "serviceName": "main-headless", "template": {}},
        });

        // Observation read: no workload yet.
        let this = self
            .expect(&http::Method::GET, sts_path, error_response(404, "NotFound"))
            .await?
            .0;
        // Pending status before anything is applied.
        let (this, body) = this
            .expect(
                &http::Method::PATCH,
                status_path,
                Response::builder().body(ok_body(&cluster_body)).unwrap(),
            )
            .await?;
        assert_eq!(body["status"]["qdrantStatus"], "Pending");
        // Supporting objects, in the documented order.
        let this = this
            .expect(
                &http::Method::PATCH,
                "/api/v1/namespaces/default/configmaps/main-config",
                Response::builder().body(ok_body(&json!({}))).unwrap(),
            )
            .await?
            .0;
        let (this, body) = this
            .expect(
                &http::Method::PATCH,
                "/api/v1/namespaces/default/secrets/main-auth",
                Response::builder().body(ok_body(&json!({}))).unwrap(),
            )
            .await?;
        assert_eq!(body["kind"], "Secret");
        let this = this
            .expect(
                &http::Method::PATCH,
                "/api/v1/namespaces/default/services/main-headless",
                Response::builder().body(ok_body(&json!({}))).unwrap(),
            )
            .await?
            .0;
        let this = this
            .expect(
                &http::Method::PATCH,
                "/api/v1/namespaces/default/services/main",
                Response::builder().body(ok_body(&json!({}))).unwrap(),
            )
            .await?
            .0;
        let this = this
            .expect(
                &http::Method::PATCH,
                "/apis/policy/v1/namespaces/default/poddisruptionbudgets/main",
                Response::builder().body(ok_body(&json!({}))).unwrap(),
            )
            .await?
            .0;
        // The workload itself.
        let (this, body) = this
            .expect(
                &http::Method::PATCH,
                sts_path,
                Response::builder().body(ok_body(&sts_body)).unwrap(),
            )
            .await?;
        assert_json_diff::assert_json_include!(
            actual: body.clone(),
            expected: json!({
                "kind": "StatefulSet",
                "spec": {"replicas": 1, "serviceName": "main-headless"},
            })
        );
        // Cache refresh.
        let this = this
            .expect(
                &http::Method::GET,
                sts_path,
                Response::builder().body(ok_body(&sts_body)).unwrap(),
            )
            .await?
            .0;
        // Applied hash lands on status.
        let (this, body) = this
            .expect(
                &http::Method::PATCH,
                status_path,
                Response::builder().body(ok_body(&cluster_body)).unwrap(),
            )
            .await?;
        assert_eq!(body["status"]["lastAppliedHash"], hash.as_str());
        Ok(this)
    }

    async fn handle_cheap_applies(self) -> Result<Self> {
        let mut this = self;
        for path in [
            "/api/v1/namespaces/default/configmaps/main-config",
            "/api/v1/namespaces/default/secrets/main-auth",
            "/api/v1/namespaces/default/services/main-headless",
            "/api/v1/namespaces/default/services/main",
            "/apis/policy/v1/namespaces/default/poddisruptionbudgets/main",
        ] {
            this = this
                .expect(
                    &http::Method::PATCH,
                    path,
                    Response::builder().body(ok_body(&json!({}))).unwrap(),
                )
                .await?
                .0;
        }
        Ok(this)
    }

    async fn handle_cleanup_absent_workload(self) -> Result<Self> {
        let sts_path = "/apis/apps/v1/namespaces/default/statefulsets/gone";
        let status_path =
            "/apis/qdrant.operator/v1alpha1/namespaces/default/qdrantclusters/gone/status";
        let object_path = "/apis/qdrant.operator/v1alpha1/namespaces/default/qdrantclusters/gone";

        // Workload already removed by an external actor.
        let this = self
            .expect(&http::Method::GET, sts_path, error_response(404, "NotFound"))
            .await?
            .0;
        let (this, body) = this
            .expect(
                &http::Method::PATCH,
                status_path,
                Response::builder()
                    .body(ok_body(&cluster_json("gone", "5", 1, "qdrant/qdrant:v1.16.3")))
                    .unwrap(),
            )
            .await?;
        assert_eq!(body["status"]["cleanupPhase"], "Completed");
        assert_eq!(body["status"]["cleanupAttempts"], 0);
        // Release: read the object, then a guarded json-patch removal.
        let (this, _) = this
            .expect(
                &http::Method::GET,
                object_path,
                Response::builder()
                    .body(ok_body(&cluster_json("gone", "5", 1, "qdrant/qdrant:v1.16.3")))
                    .unwrap(),
            )
            .await?;
        let (this, body) = this
            .expect(
                &http::Method::PATCH,
                object_path,
                Response::builder()
                    .body(ok_body(&cluster_json("gone", "6", 1, "qdrant/qdrant:v1.16.3")))
                    .unwrap(),
            )
            .await?;
        assert_eq!(body[0]["op"], "test");
        assert_eq!(body[0]["value"], "qdrant.operator/finalizer");
        assert_eq!(body[1]["op"], "remove");
        assert_eq!(body[1]["path"], "/metadata/finalizers/0");
        Ok(this)
    }
}

#[tokio::test]
async fn invalid_spec_is_reported_before_dedup_and_never_scheduled() {
    let (client, fakeserver) = testcontext();
    let (ctx, mut sched_rx) = operator_context(client);
    let mocksrv = fakeserver.run(Scenario::InvalidSpecStatus);

    let bad = cluster(cluster_json("bad", "1", 0, "qdrant/qdrant:v1.16.3"));
    let router = Router::new(ctx.clone());
    router.run(stream::iter([Event::Applied(bad)])).await;

    timeout_after_5s(mocksrv).await;
    // Nothing was queued: only a spec edit can fix an invalid object.
    assert!(sched_rx.try_recv().is_err());
    // The version was recorded anyway so the event is not reprocessed.
    let key = Key::new("default", "bad");
    assert!(ctx.state.clusters.lock().is_duplicate(&key, "1"));
}

#[tokio::test]
async fn duplicate_resource_versions_are_dropped() {
    let (client, fakeserver) = testcontext();
    let (ctx, mut sched_rx) = operator_context(client);
    // The fixture already carries the finalizer, so no API call is expected.
    let mocksrv = fakeserver.run(Scenario::RadioSilence);

    let obj = cluster(cluster_json("main", "1", 1, "qdrant/qdrant:v1.16.3"));
    let router = Router::new(ctx.clone());
    router
        .run(stream::iter([
            Event::Applied(obj.clone()),
            Event::Applied(obj),
        ]))
        .await;

    timeout_after_5s(mocksrv).await;
    let first = sched_rx.try_recv().unwrap();
    assert_eq!(first.request.kind, ResourceKind::Cluster);
    assert_eq!(first.request.key, Key::new("default", "main"));
    assert!(sched_rx.try_recv().is_err(), "second event must dedup");
}

#[tokio::test]
async fn missing_finalizer_is_attached_before_scheduling() {
    let (client, fakeserver) = testcontext();
    let (ctx, mut sched_rx) = operator_context(client);
    let mocksrv = fakeserver.run(Scenario::FinalizerAttach);

    let mut fresh = cluster_json("fresh", "1", 1, "qdrant/qdrant:v1.16.3");
    fresh["metadata"]
        .as_object_mut()
        .unwrap()
        .remove("finalizers");
    let router = Router::new(ctx.clone());
    router
        .run(stream::iter([Event::Applied(cluster(fresh))]))
        .await;

    timeout_after_5s(mocksrv).await;
    assert!(sched_rx.try_recv().is_ok());
}

#[tokio::test]
async fn status_writer_retries_a_missing_subresource() {
    let (client, fakeserver) = testcontext();
    let (ctx, _sched_rx) = operator_context(client);
    let mocksrv = fakeserver.run(Scenario::StatusNotFoundRetry);

    let obj = cluster(cluster_json("main", "1", 1, "qdrant/qdrant:v1.16.3"));
    ctx.status.write_phase(&obj, Phase::Pending).await.unwrap();

    timeout_after_5s(mocksrv).await;
}

#[tokio::test]
async fn status_writer_switches_to_replace_on_conflict() {
    let (client, fakeserver) = testcontext();
    let (ctx, _sched_rx) = operator_context(client);
    let mocksrv = fakeserver.run(Scenario::StatusConflictReplace);

    let obj = cluster(cluster_json("main", "1", 1, "qdrant/qdrant:v1.16.3"));
    ctx.status.write_phase(&obj, Phase::Pending).await.unwrap();

    timeout_after_5s(mocksrv).await;
}

#[tokio::test]
async fn cluster_creation_applies_everything_in_order() {
    let (client, fakeserver) = testcontext();
    let (ctx, _sched_rx) = operator_context(client);

    let obj = cluster(cluster_json("main", "1", 1, "qdrant/qdrant:v1.16.3"));
    let hash = fingerprint(&obj.spec);
    let mocksrv = fakeserver.run(Scenario::ClusterCreation { hash });

    let key = Key::new("default", "main");
    ctx.state.clusters.lock().track(&key, "1", obj);
    reconcile::cluster::reconcile(
        &ctx,
        &WorkRequest {
            kind: ResourceKind::Cluster,
            key,
        },
    )
    .await
    .unwrap();

    timeout_after_5s(mocksrv).await;
}

#[tokio::test]
async fn unchanged_spec_reapplies_only_cheap_resources() {
    let (client, fakeserver) = testcontext();
    let (ctx, _sched_rx) = operator_context(client);
    let mocksrv = fakeserver.run(Scenario::ClusterNoDrift);

    let mut value = cluster_json("main", "4", 1, "qdrant/qdrant:v1.16.3");
    let mut obj = cluster(value.clone());
    value["status"] = json!({
        "qdrantStatus": "Healthy",
        "lastAppliedHash": fingerprint(&obj.spec),
        "observedGeneration": 1,
    });
    obj = cluster(value);

    let key = Key::new("default", "main");
    ctx.state.clusters.lock().track(&key, "4", obj);
    // Seed the workload cache so no observation read is needed.
    ctx.state.cache_workload(
        &key,
        Some(serde_json::from_value(json!({
            "metadata": {"name": "main", "namespace": "default"},
        })).unwrap()),
    );

    reconcile::cluster::reconcile(
        &ctx,
        &WorkRequest {
            kind: ResourceKind::Cluster,
            key,
        },
    )
    .await
    .unwrap();

    timeout_after_5s(mocksrv).await;
    assert_eq!(ctx.metrics.drift_detected.get(), 0);
}

#[tokio::test]
async fn cleanup_completes_when_the_workload_is_already_gone() {
    let (client, fakeserver) = testcontext();
    let (ctx, _sched_rx) = operator_context(client);
    let mocksrv = fakeserver.run(Scenario::CleanupAbsentWorkload);

    let mut value = cluster_json("gone", "5", 1, "qdrant/qdrant:v1.16.3");
    value["metadata"]["deletionTimestamp"] = json!("2026-08-01T00:00:00Z");
    cleanup::cluster(ctx.clone(), cluster(value)).await;

    timeout_after_5s(mocksrv).await;
    assert_eq!(ctx.metrics.cleanup_force_deletes.get(), 0);
}

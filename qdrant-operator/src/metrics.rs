//! Prometheus metrics and the exposition endpoint.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// All operator metrics, registered against one registry.
#[derive(Clone)]
pub struct Metrics {
    pub registry: Registry,
    /// Reconcile attempts, labeled by kind and outcome.
    pub reconciles: IntCounterVec,
    /// Spec fingerprint mismatches against a previously applied hash.
    pub drift_detected: IntCounter,
    /// Watch stream reconnects, labeled by failure reason.
    pub watch_restarts: IntCounterVec,
    /// Errors surfaced anywhere in the control loop, labeled by type.
    pub errors: IntCounterVec,
    /// Finalizers removed through the force-delete escape hatch.
    pub cleanup_force_deletes: IntCounter,
    /// Reconcile requests currently debounced or waiting for a slot.
    pub queue_depth: IntGauge,
    /// Live watch streams.
    pub active_watches: IntGauge,
    /// Resources currently tracked, labeled by kind.
    pub managed: IntGaugeVec,
    /// 1 while this process holds the leader lease.
    pub leader: IntGauge,
    /// Wall-clock duration of reconciles, labeled by kind.
    pub reconcile_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new_custom(Some("qdrant_operator".into()), None)?;
        let reconciles = IntCounterVec::new(
            Opts::new("reconciles_total", "Reconcile attempts by kind and result"),
            &["kind", "result"],
        )?;
        let drift_detected = IntCounter::new(
            "drift_detected_total",
            "Reconciles where the spec fingerprint diverged from the applied hash",
        )?;
        let watch_restarts = IntCounterVec::new(
            Opts::new("watch_restarts_total", "Watch stream reconnects by reason"),
            &["reason"],
        )?;
        let errors = IntCounterVec::new(
            Opts::new("errors_total", "Control loop errors by type"),
            &["type"],
        )?;
        let cleanup_force_deletes = IntCounter::new(
            "cleanup_force_deletes_total",
            "Finalizers removed after exhausting cleanup retries",
        )?;
        let queue_depth = IntGauge::new("queue_depth", "Pending reconcile requests")?;
        let active_watches = IntGauge::new("active_watches", "Live watch streams")?;
        let managed = IntGaugeVec::new(
            Opts::new("managed_resources", "Tracked resources by kind"),
            &["kind"],
        )?;
        let leader = IntGauge::new("leader", "1 while this instance holds the lease")?;
        let reconcile_duration = HistogramVec::new(
            HistogramOpts::new("reconcile_duration_seconds", "Reconcile duration by kind")
                .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 15.0, 60.0]),
            &["kind"],
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(drift_detected.clone()))?;
        registry.register(Box::new(watch_restarts.clone()))?;
        registry.register(Box::new(errors.clone()))?;
        registry.register(Box::new(cleanup_force_deletes.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(active_watches.clone()))?;
        registry.register(Box::new(managed.clone()))?;
        registry.register(Box::new(leader.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;

        Ok(Metrics {
            registry,
            reconciles,
            drift_detected,
            watch_restarts,
            errors,
            cleanup_force_deletes,
            queue_depth,
            active_watches,
            managed,
            leader,
            reconcile_duration,
        })
    }
}

/// Serves `/metrics` and `/healthz` until `shutdown` fires.
pub async fn serve(
    metrics: Arc<Metrics>,
    port: u16,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;
    info!(%addr, "serving metrics and health probes");
    loop {
        let (stream, _) = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            accepted = listener.accept() => accepted?,
        };
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let io = TokioIo::new(stream);
            let service = service_fn(move |req| respond(metrics.clone(), req));
            if let Err(err) = hyper::server::conn::http1::Builder::new()
                .serve_connection(io, service)
                .await
            {
                debug!(error = %err, "metrics connection closed with error");
            }
        });
    }
}

async fn respond(
    metrics: Arc<Metrics>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let response = match req.uri().path() {
        "/metrics" => {
            let mut buffer = Vec::new();
            match TextEncoder::new().encode(&metrics.registry.gather(), &mut buffer) {
                Ok(()) => Response::builder()
                    .header(hyper::header::CONTENT_TYPE, prometheus::TEXT_FORMAT)
                    .body(Full::new(Bytes::from(buffer))),
                Err(err) => Response::builder()
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Full::new(Bytes::from(err.to_string()))),
            }
        }
        "/healthz" => Response::builder().body(Full::new(Bytes::from_static(b"ok"))),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::new())),
    };
    // Builder only fails on malformed headers, which these are not.
    Ok(response.unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_all_families_under_the_operator_prefix() {
        let metrics = Metrics::new().unwrap();
        metrics.reconciles.with_label_values(&["cluster", "ok"]).inc();
        metrics.watch_restarts.with_label_values(&["rate_limited"]).inc();
        metrics.leader.set(1);
        let mut exposition = String::new();
        TextEncoder::new()
            .encode_utf8(&metrics.registry.gather(), &mut exposition)
            .unwrap();
        assert!(exposition.contains("qdrant_operator_reconciles_total"));
        assert!(exposition.contains("qdrant_operator_leader 1"));
        assert!(exposition.contains("qdrant_operator_watch_restarts_total{reason=\"rate_limited\"} 1"));
    }

    #[test]
    fn second_instance_gets_its_own_registry() {
        // Not process-global statics: two instances must not collide.
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.drift_detected.inc();
        assert_eq!(b.drift_detected.get(), 0);
    }
}

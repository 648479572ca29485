//! Operator configuration.
//!
//! Everything comes from the environment (the Downward API provides the pod
//! identity). Missing required values abort startup with a non-zero exit,
//! before any cluster access happens.

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "qdrant-operator", about = "Operator for qdrant clusters and collections")]
pub struct Settings {
    /// Identity used as the lease holder. Comes from the Downward API.
    #[arg(long, env = "POD_NAME")]
    pub pod_name: String,

    /// Namespace the operator (and its lease) lives in.
    #[arg(long, env = "POD_NAMESPACE")]
    pub pod_namespace: String,

    /// Enable debug logging.
    #[arg(long, env = "QDRANT_OPERATOR_DEBUG")]
    pub debug: bool,

    /// Port serving /metrics and /healthz.
    #[arg(long, env = "METRICS_PORT", default_value_t = 8080)]
    pub metrics_port: u16,

    /// Image used for backup and restore jobs. Defaults to the cluster image.
    #[arg(long, env = "JOB_IMAGE")]
    pub job_image: Option<String>,
}

use std::sync::Arc;

use clap::Parser;
use kube::Client;
use qdrant_operator::config::Settings;
use qdrant_operator::metrics::{self, Metrics};
use qdrant_operator::{run, telemetry};
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Missing POD_NAME/POD_NAMESPACE abort here with a non-zero exit.
    let settings = Settings::parse();
    telemetry::init(settings.debug);

    let metrics = Arc::new(Metrics::new()?);
    let client = Client::try_default().await?;

    let server_token = CancellationToken::new();
    let server = tokio::spawn(metrics::serve(
        metrics.clone(),
        settings.metrics_port,
        server_token.clone(),
    ));

    let result = run::run(client, settings, metrics).await;

    server_token.cancel();
    if let Ok(Err(err)) = server.await {
        warn!(error = %err, "metrics server exited with error");
    }
    Ok(result?)
}

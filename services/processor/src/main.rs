use anyhow::{Context, Result};
use aws_config::{BehaviorVersion, Region};
use image_processor::{
    Config, DynamoMetadataStore, ImageWorker, S3AssetStore, SqsTaskQueue, TaskQueue,
};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = Config::load().context("Failed to load configuration")?;

    // Initialize logging
    init_tracing(&config.service.log_level, &config.service.log_format);

    info!(
        service = %config.service.name,
        region = %config.aws.region,
        "Starting image processor worker"
    );

    // Initialize metrics
    init_metrics(config.service.metrics_port)?;

    // One SDK configuration shared by every client
    let sdk_config = aws_config::defaults(BehaviorVersion::latest())
        .region(Region::new(config.aws.region.clone()))
        .load()
        .await;

    let assets = Arc::new(S3AssetStore::new(&sdk_config, &config.aws, &config.storage));
    let metadata = Arc::new(DynamoMetadataStore::new(
        &sdk_config,
        &config.aws,
        &config.metadata,
    ));
    let queue = SqsTaskQueue::new(&sdk_config, &config.aws, &config.queue);

    let mut worker = ImageWorker::new(
        Arc::new(queue.clone()),
        assets,
        metadata,
        config.worker.clone(),
    )
    .with_max_messages(config.queue.max_messages)
    .with_attempt_limit(config.queue.attempt_limit());

    if let Some(ref url) = config.queue.dead_letter_queue_url {
        info!(dead_letter_queue_url = %url, "Dead-letter forwarding enabled");
        let dead_letter: Arc<dyn TaskQueue> = Arc::new(queue.for_queue(url.clone()));
        worker = worker.with_dead_letter(dead_letter);
    }

    let shutdown = CancellationToken::new();

    // Spawn worker task
    let worker_handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move { worker.run(shutdown).await }
    });

    info!("Image processor worker started successfully");

    // Wait for shutdown signal
    shutdown_signal().await;

    info!("Shutting down image processor worker");

    // The worker finishes its current task before exiting
    shutdown.cancel();
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Worker task ended abnormally");
    }

    info!("Image processor worker stopped");

    Ok(())
}

/// Initialize tracing/logging
fn init_tracing(log_level: &str, log_format: &str) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(log_level));

    let registry = tracing_subscriber::registry().with(env_filter);

    if log_format == "pretty" {
        registry.with(fmt::layer().pretty()).init();
    } else {
        registry.with(fmt::layer().json()).init();
    }
}

/// Initialize Prometheus metrics exporter
fn init_metrics(port: u16) -> Result<()> {
    let builder = metrics_exporter_prometheus::PrometheusBuilder::new();

    builder
        .with_http_listener(([0, 0, 0, 0], port))
        .install()
        .context("Failed to install Prometheus metrics exporter")?;

    info!(port = port, "Prometheus metrics exporter started");

    Ok(())
}

/// Wait for shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        _ = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}

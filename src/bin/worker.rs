use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

use photopipe::{
    app_state::PipelineContext,
    config::PipelineConfig,
    db::{self, PgAssetStore},
    models::task::{BatchStatus, QueueName},
    pipeline::{self, maintenance, supervisor},
    services::{
        blobstore::S3BlobStore,
        inference::HttpInferenceClient,
        notifier::{RedisNotifier, ResultNotifier},
        queue::{RedisTaskQueue, TaskQueue},
        similarity::{Projection, SimilarityIndex, UnitClusterer},
    },
    store::StagingStore,
};

#[tokio::main]
async fn main() {
    // Initialize structured logging
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting photopipe worker");

    // Load configuration
    let config = PipelineConfig::from_env().expect("Failed to load configuration");

    // Prometheus exporter, when configured
    if let Some(addr) = &config.metrics_addr {
        let addr: std::net::SocketAddr = addr.parse().expect("Invalid metrics address");
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .expect("Failed to install Prometheus exporter");
    }

    // Register application metrics
    metrics::describe_counter!("pipeline_batches_total", "Total pipeline tasks executed");
    metrics::describe_counter!(
        "pipeline_batches_failed",
        "Pipeline tasks that reported batch-level failure"
    );
    metrics::describe_histogram!("pipeline_task_seconds", "Time to execute one pipeline task");
    metrics::describe_histogram!(
        "inference_request_seconds",
        "Latency of inference endpoint requests"
    );
    metrics::describe_counter!(
        "retry_resubmissions_total",
        "Failed tasks resubmitted by the retry supervisor"
    );
    metrics::describe_gauge!("queue_depth", "Current number of pending tasks per queue");

    // Initialize database
    tracing::info!("Connecting to PostgreSQL");
    let db_pool = db::init_pool(&config.database_url)
        .await
        .expect("Failed to connect to database");

    tracing::info!("Running database migrations");
    db::run_migrations(&db_pool)
        .await
        .expect("Failed to run database migrations");

    // Open the staging store
    tracing::info!("Opening staging store");
    let staging =
        Arc::new(StagingStore::open(&config.staging_path).expect("Failed to open staging store"));

    // Missing or malformed weights are a fatal configuration error: abort
    // before any pipeline work starts.
    tracing::info!("Loading projection weights");
    let projection = Projection::load(&config.projection_weights_path)
        .expect("Failed to load projection weights");
    let index = Arc::new(SimilarityIndex::new(projection, Box::new(UnitClusterer)));

    // Initialize services
    tracing::info!("Initializing services");
    let queue =
        Arc::new(RedisTaskQueue::new(&config.redis_url).expect("Failed to initialize task queue"));
    let notifier =
        Arc::new(RedisNotifier::new(&config.redis_url).expect("Failed to initialize notifier"));
    let inference = Arc::new(
        HttpInferenceClient::new(config.inference_endpoints())
            .expect("Failed to initialize inference client"),
    );
    let blobs = Arc::new(
        S3BlobStore::new(
            &config.blob_bucket,
            &config.blob_endpoint,
            &config.blob_access_key,
            &config.blob_secret_key,
        )
        .expect("Failed to initialize blob store"),
    );

    let ctx = PipelineContext::new(
        Arc::new(PgAssetStore::new(db_pool)),
        staging,
        queue,
        notifier,
        inference,
        blobs,
        index.clone(),
        config.pipeline_settings(),
    );

    // Similarity consumer: subscribe before any processing so no published
    // embedding is missed.
    let subscriber = ctx
        .notifier
        .subscribe()
        .await
        .expect("Failed to subscribe to result notifications");
    tokio::spawn(consume_results(subscriber, index));

    // Retry supervisor on its fixed schedule
    let sweep_ctx = ctx.clone();
    let sweep_interval = Duration::from_secs(config.retry_sweep_interval_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(sweep_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = supervisor::sweep(&sweep_ctx).await {
                tracing::error!(error = %e, "Retry sweep failed");
            }
        }
    });

    // Maintenance sweep
    let maintenance_ctx = ctx.clone();
    let maintenance_interval = Duration::from_secs(config.maintenance_interval_secs);
    let is_new_ttl = chrono::Duration::seconds(config.is_new_ttl_secs as i64);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(maintenance_interval);
        interval.tick().await;
        loop {
            interval.tick().await;
            if let Err(e) = maintenance::run(&maintenance_ctx, is_new_ttl).await {
                tracing::error!(error = %e, "Maintenance sweep failed");
            }
        }
    });

    tracing::info!("Worker ready, starting task processing loop");

    // Main processing loop
    let poll_interval = Duration::from_millis(config.poll_interval_ms);
    loop {
        match process_next_task(&ctx).await {
            Ok(true) => {
                tracing::debug!("Task processed, checking for next task");
            }
            Ok(false) => {
                tracing::trace!("No tasks available, sleeping");
                record_queue_depths(&ctx).await;
                sleep(poll_interval).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Error processing task, will retry");
                sleep(poll_interval).await;
            }
        }
    }
}

/// Pull one task off the queues, in dequeue order.
/// Returns Ok(true) if a task was processed, Ok(false) if all queues were empty.
async fn process_next_task(ctx: &PipelineContext) -> Result<bool, Box<dyn std::error::Error>> {
    for queue in QueueName::ALL {
        let task = match ctx.queue.dequeue(queue).await? {
            Some(t) => t,
            None => continue,
        };

        let task_id = task.task_id();
        tracing::info!(task_id = %task_id, queue = queue.as_str(), "Processing task");

        let report = pipeline::run_task(ctx, task.clone()).await?;
        ctx.queue.complete(&task).await?;

        if report.status == BatchStatus::Failure {
            tracing::warn!(
                task_id = %task_id,
                errors = ?report.errors,
                "Task reported batch failure"
            );
        }
        return Ok(true);
    }
    Ok(false)
}

async fn record_queue_depths(ctx: &PipelineContext) {
    for queue in QueueName::ALL {
        if let Ok(depth) = ctx.queue.depth(queue).await {
            metrics::gauge!("queue_depth", "queue" => queue.as_str()).set(depth as f64);
        }
    }
}

/// Feed published face embeddings into the similarity index.
async fn consume_results(
    mut stream: futures::stream::BoxStream<'static, photopipe::services::notifier::Notification>,
    index: Arc<SimilarityIndex>,
) {
    while let Some(notification) = stream.next().await {
        let payload = match notification.payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(id = %notification.id, error = %e, "Undecodable notification, skipping");
                continue;
            }
        };
        let Some(raw) = payload.get("embeddings") else {
            continue;
        };
        match serde_json::from_value::<Vec<Vec<f32>>>(raw.clone()) {
            Ok(embeddings) => {
                index.ingest(notification.asset_id(), embeddings);
                tracing::debug!(id = %notification.id, "Indexed published embeddings");
            }
            Err(e) => {
                tracing::warn!(id = %notification.id, error = %e, "Malformed embeddings in notification, skipping");
            }
        }
    }
}

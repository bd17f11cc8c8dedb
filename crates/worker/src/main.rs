use std::sync::Arc;
use std::time::Duration;

use a6hub_db::store::PgStore;
use a6hub_events::{PgNotifyBus, ProgressPublisher};
use a6hub_pipeline::{
    ArtifactUploader, BuildDriver, DbFileSource, LocalArtifactUploader, NoopUploader,
};
use a6hub_worker::config::WorkerConfig;
use a6hub_worker::dispatcher::Dispatcher;
use a6hub_worker::reaper::Reaper;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    // --- Tracing ---
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "a6hub_worker=debug,a6hub_pipeline=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // --- Configuration ---
    let config = WorkerConfig::from_env().expect("Invalid worker configuration");
    tracing::info!(
        worker_id = %config.worker_id,
        concurrency = config.concurrency,
        workspace_root = %config.workspace_root.display(),
        "Loaded worker configuration"
    );

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");

    let pool = a6hub_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    a6hub_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    tracing::info!("Database health check passed");

    tokio::fs::create_dir_all(&config.workspace_root)
        .await
        .expect("Failed to create workspace root");

    // --- Collaborators ---
    let store = Arc::new(PgStore::new(pool.clone()));
    let publisher = ProgressPublisher::new(Arc::new(PgNotifyBus::new(pool.clone())));
    let uploader: Arc<dyn ArtifactUploader> = match &config.artifacts_dir {
        Some(dir) => Arc::new(LocalArtifactUploader::new(dir)),
        None => {
            tracing::warn!("ARTIFACTS_DIR not set, artifacts will be discarded");
            Arc::new(NoopUploader)
        }
    };

    let driver = BuildDriver::new(
        store.clone(),
        Arc::new(DbFileSource::new(pool)),
        uploader,
        publisher.clone(),
        config.driver_config(),
        config.worker_id.clone(),
    );
    let dispatcher = Dispatcher::new(store.clone(), store.clone(), driver, publisher.clone(), &config);
    let reaper = Reaper::new(store.clone(), store, publisher, &config);

    // --- Run ---
    let cancel = CancellationToken::new();

    let reaper_cancel = cancel.clone();
    let reaper_handle = tokio::spawn(async move {
        reaper.run(reaper_cancel).await;
    });

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    dispatcher.run(cancel).await;

    let _ = tokio::time::timeout(Duration::from_secs(5), reaper_handle).await;
    tracing::info!("Worker stopped");
}

/// Wait for SIGINT or SIGTERM. Running jobs are allowed to finish.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl-C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received SIGINT (Ctrl-C), draining running jobs");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, draining running jobs");
        }
    }
}

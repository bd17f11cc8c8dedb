use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use a6hub_db::store::PgStore;
use a6hub_events::{PgNotifyBus, ProgressPublisher, UpdateBus};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use a6hub_api::config::ServerConfig;
use a6hub_api::router::build_app_router;
use a6hub_api::state::AppState;
use a6hub_api::ws::{self, JobFanout};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "a6hub_api=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env();
    tracing::info!(host = %config.host, port = %config.port, "Loaded server configuration");

    // --- Database ---
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = a6hub_db::create_pool(&database_url)
        .await
        .expect("Failed to connect to database");
    a6hub_db::health_check(&pool)
        .await
        .expect("Database health check failed");
    a6hub_db::run_migrations(&pool)
        .await
        .expect("Failed to run database migrations");
    tracing::info!("Database ready, migrations applied");

    // --- Job updates ---
    // Workers publish through NOTIFY; this process only relays.
    let bus: Arc<dyn UpdateBus> = Arc::new(PgNotifyBus::new(pool.clone()));
    let fanout = Arc::new(JobFanout::new(Arc::clone(&bus)));
    let heartbeat = ws::start_heartbeat(Arc::clone(&fanout));

    let store = Arc::new(PgStore::new(pool));
    let state = AppState {
        store: store.clone(),
        queue: store,
        config: Arc::new(config.clone()),
        publisher: ProgressPublisher::new(bus),
        fanout: Arc::clone(&fanout),
    };
    let app = build_app_router(state);

    let addr = SocketAddr::new(
        config.host.parse().expect("Invalid HOST address"),
        config.port,
    );
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind to address");
    tracing::info!(%addr, "Listening");

    let shutdown = CancellationToken::new();
    tokio::spawn(close_on_signal(Arc::clone(&fanout), shutdown.clone()));

    let server = async {
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await
    };
    let drain_limit = Duration::from_secs(config.shutdown_timeout_secs);
    tokio::select! {
        result = server => result.expect("Server error"),
        () = async {
            shutdown.cancelled().await;
            tokio::time::sleep(drain_limit).await;
        } => {
            tracing::warn!(
                timeout_secs = config.shutdown_timeout_secs,
                "Shutdown timed out with requests in flight"
            );
        }
    }

    heartbeat.abort();
    tracing::info!("Graceful shutdown complete");
}

/// Live subscriptions never end on their own, so they are closed before
/// the server starts draining.
async fn close_on_signal(fanout: Arc<JobFanout>, shutdown: CancellationToken) {
    shutdown_signal().await;
    fanout.shutdown_all().await;
    shutdown.cancel();
}

/// Resolves on SIGINT, or SIGTERM on Unix.
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
        () = ctrl_c => tracing::info!("Received SIGINT, shutting down"),
        () = terminate => tracing::info!("Received SIGTERM, shutting down"),
    }
}

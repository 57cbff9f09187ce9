//! API server entry point.

use std::sync::Arc;

use api::SagaRuntime;
use api::config::Config;
use metrics_exporter_prometheus::PrometheusHandle;
use saga_store::{
    IdempotencyTracker, InMemoryIdempotencyTracker, InMemorySagaStore, PostgresIdempotencyTracker,
    PostgresSagaStore, SagaStore,
};
use sqlx::postgres::PgPoolOptions;
use tokio::signal;
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Waits for a shutdown signal (SIGINT or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("received SIGINT, starting graceful shutdown");
        }
        () = terminate => {
            tracing::info!("received SIGTERM, starting graceful shutdown");
        }
    }
}

fn init_tracing(config: &Config) {
    let filter = EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(config.log_json.then(|| tracing_subscriber::fmt::layer().json()))
        .with((!config.log_json).then(tracing_subscriber::fmt::layer))
        .init();
}

/// Runs the consumers and the HTTP server until a shutdown signal.
async fn serve<S, I>(config: &Config, runtime: SagaRuntime<S, I>, metrics_handle: PrometheusHandle)
where
    S: SagaStore + 'static,
    I: IdempotencyTracker + 'static,
{
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers = runtime.spawn(shutdown_rx).await;

    let app = api::create_app(runtime.state(), metrics_handle);

    let addr = config.addr();
    tracing::info!(%addr, "starting API server");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind address");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .expect("server error");

    // Stop consuming; in-flight sagas resume from the store on next start.
    let _ = shutdown_tx.send(true);
    for worker in workers {
        match worker.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "consumer stopped with error"),
            Err(e) => tracing::error!(error = %e, "consumer panicked"),
        }
    }

    tracing::info!("server shut down gracefully");
}

#[tokio::main]
async fn main() {
    // 1. Load configuration
    let config = Config::from_env().expect("invalid configuration");

    // 2. Initialize tracing
    init_tracing(&config);

    // 3. Install Prometheus metrics recorder
    let metrics_handle = api::routes::metrics::recorder_builder()
        .and_then(|builder| builder.install_recorder())
        .expect("failed to install Prometheus recorder");

    // 4. Wire the saga runtime onto the configured backend
    match config.database_url.clone() {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(&url)
                .await
                .expect("failed to connect to PostgreSQL");
            let store = PostgresSagaStore::new(pool.clone());
            store.run_migrations().await.expect("migrations failed");

            let runtime = SagaRuntime::new(&config, "postgres", Arc::new(store), |group| {
                PostgresIdempotencyTracker::new(pool.clone(), group)
            })
            .expect("failed to wire sagas");
            serve(&config, runtime, metrics_handle).await;
        }
        None => {
            tracing::warn!("DATABASE_URL not set, saga state is kept in memory");
            let runtime = SagaRuntime::new(
                &config,
                "memory",
                Arc::new(InMemorySagaStore::new()),
                |_| InMemoryIdempotencyTracker::new(),
            )
            .expect("failed to wire sagas");
            serve(&config, runtime, metrics_handle).await;
        }
    }
}

//! HTTP entry point and process wiring for the saga orchestrator.
//!
//! Provides REST endpoints to start and inspect sagas, with structured
//! logging (tracing) and Prometheus metrics. [`SagaRuntime`] assembles the
//! event bus, the orchestrator and the account, payment and notification
//! participants into one process.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::routing::{get, post};
use event_bus::{DeadLetterQueue, InMemoryEventBus};
use metrics_exporter_prometheus::PrometheusHandle;
use saga::participants::{
    self, InMemoryAccountService, InMemoryNotificationService, InMemoryPaymentService,
};
use saga::{
    ACCOUNT_SERVICE_GROUP, HandlerRegistry, NOTIFICATION_SERVICE_GROUP, ORCHESTRATOR_GROUP,
    Orchestrator, PAYMENT_SERVICE_GROUP, ParticipantDispatcher, SagaRegistry,
};
use saga_store::{IdempotencyTracker, SagaStore};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::sagas::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S, I>(state: Arc<AppState<S, I>>, metrics_handle: PrometheusHandle) -> Router
where
    S: SagaStore + 'static,
    I: IdempotencyTracker + 'static,
{
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check::<S, I>))
        .route("/api/sagas", get(routes::sagas::list::<S, I>))
        .route("/api/sagas/start", post(routes::sagas::start::<S, I>))
        .route("/api/sagas/{id}", get(routes::sagas::get::<S, I>))
        .route("/api/sagas/{id}/history", get(routes::sagas::history::<S, I>))
        .route("/api/dead-letters", get(routes::sagas::dead_letters::<S, I>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

type Dispatcher<I> = ParticipantDispatcher<InMemoryEventBus, I>;

/// The orchestrator and the participants of one process, sharing a bus.
pub struct SagaRuntime<S, I>
where
    S: SagaStore,
    I: IdempotencyTracker,
{
    pub bus: Arc<InMemoryEventBus>,
    pub orchestrator: Arc<Orchestrator<S, InMemoryEventBus, I>>,
    pub dispatchers: Vec<Arc<Dispatcher<I>>>,
    pub accounts: Arc<InMemoryAccountService>,
    pub payments: Arc<InMemoryPaymentService>,
    pub notifications: Arc<InMemoryNotificationService>,
    pub dead_letters: DeadLetterQueue,
    backend: &'static str,
}

impl<S, I> SagaRuntime<S, I>
where
    S: SagaStore + 'static,
    I: IdempotencyTracker + 'static,
{
    /// Wires the standard sagas.
    ///
    /// `tracker_for` builds the idempotency tracker of one consumer group;
    /// every group gets its own.
    pub fn new<F>(
        config: &Config,
        backend: &'static str,
        store: Arc<S>,
        tracker_for: F,
    ) -> saga::Result<Self>
    where
        F: Fn(&str) -> I,
    {
        let sagas = SagaRegistry::standard();
        let bus = Arc::new(InMemoryEventBus::with_partitions(config.bus_partitions));
        let dead_letters = DeadLetterQueue::new();

        let orchestrator = Orchestrator::new(
            store,
            bus.clone(),
            Arc::new(tracker_for(ORCHESTRATOR_GROUP)),
            sagas.clone(),
            config.orchestrator(),
        )
        .with_dead_letters(dead_letters.clone());

        let accounts = Arc::new(InMemoryAccountService::new());
        let payments = Arc::new(InMemoryPaymentService::new());
        let notifications = Arc::new(InMemoryNotificationService::new());

        let dispatcher = |group: &str, handlers: HandlerRegistry| {
            Arc::new(
                ParticipantDispatcher::new(
                    group,
                    handlers,
                    Arc::new(tracker_for(group)),
                    bus.clone(),
                    config.retry_policy(),
                    dead_letters.clone(),
                )
                .with_schemas(participants::command_schemas()),
            )
        };
        let dispatchers = vec![
            dispatcher(
                ACCOUNT_SERVICE_GROUP,
                participants::account_handlers(&sagas, accounts.clone())?,
            ),
            dispatcher(
                PAYMENT_SERVICE_GROUP,
                participants::payment_handlers(&sagas, payments.clone())?,
            ),
            dispatcher(
                NOTIFICATION_SERVICE_GROUP,
                participants::notification_handlers(&sagas, notifications.clone()),
            ),
        ];

        Ok(Self {
            bus,
            orchestrator: Arc::new(orchestrator),
            dispatchers,
            accounts,
            payments,
            notifications,
            dead_letters,
            backend,
        })
    }

    /// Shared state for the HTTP handlers.
    pub fn state(&self) -> Arc<AppState<S, I>> {
        Arc::new(AppState {
            orchestrator: self.orchestrator.clone(),
            backend: self.backend,
        })
    }

    /// Starts every consumer loop.
    ///
    /// Participants are subscribed before the orchestrator recovers, so the
    /// envelopes recovery republishes reach them.
    pub async fn spawn(&self, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<saga::Result<()>>> {
        let mut workers = Vec::new();
        for dispatcher in &self.dispatchers {
            workers.push(tokio::spawn(dispatcher.clone().run(shutdown.clone())));
            self.wait_for_group(dispatcher.group()).await;
        }
        workers.push(tokio::spawn(self.orchestrator.clone().run(shutdown)));
        self.wait_for_group(ORCHESTRATOR_GROUP).await;
        workers
    }

    async fn wait_for_group(&self, group: &str) {
        let mut interval = tokio::time::interval(Duration::from_millis(5));
        for _ in 0..1000 {
            if self.bus.has_group(group).await {
                return;
            }
            interval.tick().await;
        }
        tracing::warn!(group, "Consumer group did not subscribe in time");
    }
}

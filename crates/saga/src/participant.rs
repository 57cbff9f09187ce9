//! Participant side of the protocol.
//!
//! A participant is a set of step handlers and observers registered in a
//! [`HandlerRegistry`] and driven by a [`ParticipantDispatcher`], one per
//! consumer group. The dispatcher deduplicates, runs the local action and
//! always answers a command: STEP_COMPLETED or COMPENSATED on success,
//! FAILED on any error.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use envelope::{Envelope, EventType, SchemaRegistry};
use event_bus::{DeadLetter, DeadLetterQueue, EventBus, RetryPolicy, RetryingPublisher};
use saga_store::{ApplyOutcome, IdempotencyKey, IdempotencyTracker};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::definition::SagaDefinition;
use crate::error::{Result, SagaError};

/// Payload of a FAILED envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepFailure {
    pub step: String,
    pub reason: String,
}

impl StepFailure {
    pub fn new(step: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            step: step.into(),
            reason: reason.into(),
        }
    }

    /// Encodes the failure as a JSON payload.
    pub fn to_payload(&self) -> Vec<u8> {
        // A struct of two strings always serializes.
        serde_json::to_vec(self).unwrap_or_default()
    }
}

/// Forward and compensating action of one saga step.
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Runs the step. The envelope carries the start payload (first step) or
    /// the previous step's output. Returns this step's output.
    async fn execute(&self, envelope: &Envelope) -> Result<Vec<u8>>;

    /// Undoes the step. The envelope carries the output `execute` returned.
    async fn compensate(&self, envelope: &Envelope) -> Result<Vec<u8>>;
}

/// Side effect triggered by a saga finishing.
#[async_trait]
pub trait SagaObserver: Send + Sync {
    /// Called with the orchestrator's COMPLETED or terminal FAILED envelope.
    async fn observe(&self, envelope: &Envelope) -> Result<()>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    saga_type: String,
    event_type: EventType,
    step_name: String,
}

impl RouteKey {
    fn new(saga_type: &str, event_type: EventType, step_name: &str) -> Self {
        Self {
            saga_type: saga_type.to_string(),
            event_type,
            step_name: step_name.to_string(),
        }
    }

    fn of(envelope: &Envelope) -> Self {
        Self::new(&envelope.saga_type, envelope.event_type, &envelope.step_name)
    }
}

/// What a registered route does with an envelope.
#[derive(Clone)]
pub enum Route {
    Execute {
        step: String,
        handler: Arc<dyn StepHandler>,
    },
    Compensate {
        step: String,
        handler: Arc<dyn StepHandler>,
    },
    Observe(Arc<dyn SagaObserver>),
}

/// Handlers keyed by (saga type, event type, step name).
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    routes: HashMap<RouteKey, Route>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the handler of one step of a saga.
    ///
    /// The first step of a saga is triggered by START, which carries no step
    /// name; later steps by STEP. Compensation is always COMPENSATE.
    pub fn register_step(
        &mut self,
        definition: &SagaDefinition,
        step_name: &str,
        handler: Arc<dyn StepHandler>,
    ) -> Result<()> {
        let index = definition.index_of(step_name).ok_or_else(|| {
            SagaError::InvalidDefinition(format!(
                "{} has no step '{step_name}'",
                definition.saga_type()
            ))
        })?;

        let saga_type = definition.saga_type();
        let execute_key = if index == 0 {
            RouteKey::new(saga_type, EventType::Start, "")
        } else {
            RouteKey::new(saga_type, EventType::Step, step_name)
        };

        self.routes.insert(
            execute_key,
            Route::Execute {
                step: step_name.to_string(),
                handler: handler.clone(),
            },
        );
        self.routes.insert(
            RouteKey::new(saga_type, EventType::Compensate, step_name),
            Route::Compensate {
                step: step_name.to_string(),
                handler,
            },
        );
        Ok(())
    }

    /// Registers an observer of a saga type's COMPLETED and terminal FAILED.
    pub fn register_observer(&mut self, saga_type: &str, observer: Arc<dyn SagaObserver>) {
        self.routes.insert(
            RouteKey::new(saga_type, EventType::Completed, ""),
            Route::Observe(observer.clone()),
        );
        self.routes.insert(
            RouteKey::new(saga_type, EventType::Failed, ""),
            Route::Observe(observer),
        );
    }

    /// Finds the route for an envelope.
    pub fn route(&self, envelope: &Envelope) -> Option<&Route> {
        self.routes.get(&RouteKey::of(envelope))
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// What the dispatcher did with an envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// No handler is registered for it.
    Ignored,
    /// It was already handled.
    Duplicate,
    /// The local action ran and this result was published.
    Replied(Envelope),
    /// An observer ran.
    Observed,
}

/// Drives one participant's handlers from its consumer group.
pub struct ParticipantDispatcher<B: EventBus, I: IdempotencyTracker> {
    group: String,
    handlers: HandlerRegistry,
    schemas: SchemaRegistry,
    tracker: Arc<I>,
    bus: Arc<B>,
    publisher: RetryingPublisher<B>,
}

impl<B, I> ParticipantDispatcher<B, I>
where
    B: EventBus + 'static,
    I: IdempotencyTracker + 'static,
{
    pub fn new(
        group: impl Into<String>,
        handlers: HandlerRegistry,
        tracker: Arc<I>,
        bus: Arc<B>,
        retry: RetryPolicy,
        dead_letters: DeadLetterQueue,
    ) -> Self {
        let publisher = RetryingPublisher::new(bus.clone(), retry, dead_letters);
        Self {
            group: group.into(),
            handlers,
            schemas: SchemaRegistry::new(),
            tracker,
            bus,
            publisher,
        }
    }

    /// Validates command payloads against these schemas before acting.
    pub fn with_schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = schemas;
        self
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        self.publisher.dead_letters()
    }

    /// Handles one envelope.
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            group = %self.group,
            saga_id = %envelope.saga_id,
            event_type = %envelope.event_type,
            step = %envelope.step_name,
        )
    )]
    pub async fn dispatch(&self, envelope: &Envelope) -> Result<DispatchOutcome> {
        if envelope.is_terminal_notice() {
            self.tracker
                .mark_terminal(envelope.saga_id, Utc::now())
                .await?;
        }

        let Some(route) = self.handlers.route(envelope) else {
            return Ok(DispatchOutcome::Ignored);
        };

        let key = IdempotencyKey::of(envelope);
        if self.tracker.try_apply(&key).await? == ApplyOutcome::AlreadyApplied {
            tracing::debug!("Duplicate envelope skipped");
            return Ok(DispatchOutcome::Duplicate);
        }

        match route {
            Route::Execute { step, handler } => {
                let result = match self.validate(envelope).await {
                    Ok(()) => handler.execute(envelope).await,
                    Err(e) => Err(e),
                };
                let reply = self.reply(envelope, step, result, EventType::StepCompleted);
                self.publisher.publish(&reply).await?;
                Ok(DispatchOutcome::Replied(reply))
            }
            Route::Compensate { step, handler } => {
                let result = handler.compensate(envelope).await;
                let reply = self.reply(envelope, step, result, EventType::Compensated);
                self.publisher.publish(&reply).await?;
                Ok(DispatchOutcome::Replied(reply))
            }
            Route::Observe(observer) => {
                if let Err(e) = observer.observe(envelope).await {
                    // Let a redelivery try again.
                    self.tracker.release(&key).await?;
                    tracing::error!(error = %e, "Observer failed");
                    return Err(e);
                }
                Ok(DispatchOutcome::Observed)
            }
        }
    }

    async fn validate(&self, envelope: &Envelope) -> Result<()> {
        if let Err(e) = self.schemas.validate(envelope) {
            let payload = envelope::encode(envelope).unwrap_or_default();
            self.publisher
                .dead_letters()
                .push(DeadLetter::rejected(payload, &self.group, e.to_string()))
                .await;
            return Err(e.into());
        }
        Ok(())
    }

    fn reply(
        &self,
        envelope: &Envelope,
        step: &str,
        result: Result<Vec<u8>>,
        success: EventType,
    ) -> Envelope {
        match result {
            Ok(output) => {
                tracing::info!(step, result = %success, "Step action succeeded");
                envelope.reply(success, step, output)
            }
            Err(e) => {
                let reason = match e {
                    SagaError::ParticipantActionFailed { reason, .. } => reason,
                    other => other.to_string(),
                };
                tracing::warn!(step, reason = %reason, "Step action failed");
                envelope.reply(
                    EventType::Failed,
                    step,
                    StepFailure::new(step, reason).to_payload(),
                )
            }
        }
    }

    /// Consumes the group's partitions until shutdown.
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let subscription = self.bus.subscribe(&self.group).await?;
        tracing::info!(
            group = %self.group,
            partitions = subscription.partition_count(),
            "Participant dispatcher started"
        );

        let mut workers = Vec::new();
        for mut partition in subscription.into_partitions() {
            let this = self.clone();
            let mut shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        delivery = partition.recv() => match delivery {
                            Some(delivery) => this.consume(delivery.payload).await,
                            None => break,
                        },
                    }
                }
            }));
        }

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(group = %self.group, error = %e, "Partition worker panicked");
            }
        }
        tracing::info!(group = %self.group, "Participant dispatcher stopped");
        Ok(())
    }

    async fn consume(&self, payload: Vec<u8>) {
        let envelope = match envelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(group = %self.group, error = %e, "Undecodable envelope");
                self.publisher
                    .dead_letters()
                    .push(DeadLetter::rejected(payload, &self.group, e.to_string()))
                    .await;
                return;
            }
        };

        if let Err(e) = self.dispatch(&envelope).await {
            tracing::error!(
                group = %self.group,
                saga_id = %envelope.saga_id,
                event_type = %envelope.event_type,
                error = %e,
                "Dispatch failed"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::definition::{PAYMENT_TRANSFER, SagaRegistry};
    use common::SagaId;
    use event_bus::InMemoryEventBus;
    use saga_store::InMemoryIdempotencyTracker;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Recorder {
        executed: AtomicUsize,
        compensated: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl StepHandler for Recorder {
        async fn execute(&self, _envelope: &Envelope) -> Result<Vec<u8>> {
            self.executed.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SagaError::action_failed("s", "boom"));
            }
            Ok(b"out".to_vec())
        }

        async fn compensate(&self, _envelope: &Envelope) -> Result<Vec<u8>> {
            self.compensated.fetch_add(1, Ordering::SeqCst);
            Ok(Vec::new())
        }
    }

    fn command(event_type: EventType, step: &str) -> Envelope {
        Envelope::builder()
            .saga_id(SagaId::new())
            .saga_type(PAYMENT_TRANSFER)
            .event_type(event_type)
            .step_name(step)
            .build()
    }

    fn dispatcher(
        handler: Arc<Recorder>,
        step: &str,
    ) -> (
        ParticipantDispatcher<InMemoryEventBus, InMemoryIdempotencyTracker>,
        Arc<InMemoryEventBus>,
    ) {
        let registry = SagaRegistry::standard();
        let mut handlers = HandlerRegistry::new();
        handlers
            .register_step(registry.get(PAYMENT_TRANSFER).unwrap(), step, handler)
            .unwrap();
        let bus = Arc::new(InMemoryEventBus::new());
        let dispatcher = ParticipantDispatcher::new(
            "test-service",
            handlers,
            Arc::new(InMemoryIdempotencyTracker::new()),
            bus.clone(),
            RetryPolicy::no_retry(),
            DeadLetterQueue::new(),
        );
        (dispatcher, bus)
    }

    #[test]
    fn first_step_routes_on_start() {
        let registry = SagaRegistry::standard();
        let mut handlers = HandlerRegistry::new();
        handlers
            .register_step(
                registry.get(PAYMENT_TRANSFER).unwrap(),
                "initiate_payment",
                Arc::new(Recorder::default()),
            )
            .unwrap();

        assert!(matches!(
            handlers.route(&command(EventType::Start, "")),
            Some(Route::Execute { step, .. }) if step == "initiate_payment"
        ));
        assert!(matches!(
            handlers.route(&command(EventType::Compensate, "initiate_payment")),
            Some(Route::Compensate { .. })
        ));
        assert!(handlers.route(&command(EventType::Step, "initiate_payment")).is_none());
    }

    #[test]
    fn unknown_step_cannot_be_registered() {
        let registry = SagaRegistry::standard();
        let mut handlers = HandlerRegistry::new();
        let err = handlers
            .register_step(
                registry.get(PAYMENT_TRANSFER).unwrap(),
                "ship_goods",
                Arc::new(Recorder::default()),
            )
            .unwrap_err();
        assert!(matches!(err, SagaError::InvalidDefinition(_)));
    }

    #[tokio::test]
    async fn executes_once_and_replies() {
        let handler = Arc::new(Recorder::default());
        let (dispatcher, bus) = dispatcher(handler.clone(), "update_balances");
        let step = command(EventType::Step, "update_balances");

        let outcome = dispatcher.dispatch(&step).await.unwrap();
        let DispatchOutcome::Replied(reply) = outcome else {
            panic!("expected a reply, got {outcome:?}");
        };
        assert_eq!(reply.event_type, EventType::StepCompleted);
        assert_eq!(reply.step_name, "update_balances");
        assert_eq!(reply.saga_id, step.saga_id);
        assert_ne!(reply.correlation_id, step.correlation_id);

        // Redelivery with a fresh correlation ID is still a duplicate.
        let redelivered = step.reply(EventType::Step, "update_balances", Vec::new());
        assert_eq!(
            dispatcher.dispatch(&redelivered).await.unwrap(),
            DispatchOutcome::Duplicate
        );
        assert_eq!(handler.executed.load(Ordering::SeqCst), 1);
        assert_eq!(bus.published_count().await, 1);
    }

    #[tokio::test]
    async fn action_errors_become_failed() {
        let handler = Arc::new(Recorder {
            fail: true,
            ..Default::default()
        });
        let (dispatcher, _bus) = dispatcher(handler, "update_balances");

        let DispatchOutcome::Replied(reply) = dispatcher
            .dispatch(&command(EventType::Step, "update_balances"))
            .await
            .unwrap()
        else {
            panic!("expected a reply");
        };
        assert_eq!(reply.event_type, EventType::Failed);
        assert_eq!(reply.step_name, "update_balances");
        let failure: StepFailure = reply.decode_payload().unwrap();
        assert_eq!(failure.reason, "boom");
    }

    #[tokio::test]
    async fn compensation_replies_compensated() {
        let handler = Arc::new(Recorder::default());
        let (dispatcher, _bus) = dispatcher(handler.clone(), "update_balances");

        let DispatchOutcome::Replied(reply) = dispatcher
            .dispatch(&command(EventType::Compensate, "update_balances"))
            .await
            .unwrap()
        else {
            panic!("expected a reply");
        };
        assert_eq!(reply.event_type, EventType::Compensated);
        assert_eq!(handler.compensated.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn schema_mismatch_fails_and_dead_letters() {
        #[derive(Deserialize)]
        #[allow(dead_code)]
        struct Needs {
            amount: f64,
        }

        let handler = Arc::new(Recorder::default());
        let (dispatcher, _bus) = dispatcher(handler.clone(), "update_balances");
        let mut schemas = SchemaRegistry::new();
        schemas.register::<Needs>(PAYMENT_TRANSFER, "update_balances");
        let dispatcher = dispatcher.with_schemas(schemas);

        let mut step = command(EventType::Step, "update_balances");
        step.payload = b"{\"amount\":\"lots\"}".to_vec();

        let DispatchOutcome::Replied(reply) = dispatcher.dispatch(&step).await.unwrap() else {
            panic!("expected a reply");
        };
        assert_eq!(reply.event_type, EventType::Failed);
        assert_eq!(handler.executed.load(Ordering::SeqCst), 0);
        assert_eq!(dispatcher.dead_letters().len().await, 1);
    }

    #[tokio::test]
    async fn unrouted_envelopes_are_ignored() {
        let (dispatcher, bus) = dispatcher(Arc::new(Recorder::default()), "update_balances");
        assert_eq!(
            dispatcher
                .dispatch(&command(EventType::StepCompleted, "update_balances"))
                .await
                .unwrap(),
            DispatchOutcome::Ignored
        );
        assert_eq!(bus.published_count().await, 0);
    }
}

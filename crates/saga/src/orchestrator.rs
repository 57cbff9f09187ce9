//! Saga orchestrator: the only writer of saga records.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{CorrelationId, SagaId, SagaState};
use envelope::{Envelope, EventType};
use event_bus::{
    BusError, DeadLetter, DeadLetterQueue, EventBus, RetryPolicy, publish_with_retry,
};
use futures_util::StreamExt;
use saga_store::{
    HistoryEntry, IdempotencyKey, IdempotencyTracker, SagaQuery, SagaRecord,
    SagaStore, StoreError,
};
use tokio::sync::{Mutex, watch};

use crate::ORCHESTRATOR_GROUP;
use crate::definition::SagaRegistry;
use crate::error::{Result, SagaError};
use crate::participant::StepFailure;
use crate::timeout::DeadlineTracker;
use crate::transition::{self, Rejection};

/// Orchestrator settings.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// How long a forward step may run before it is failed.
    pub step_timeout: Duration,
    /// How often deadlines are checked.
    pub sweep_interval: Duration,
    /// Attempts at a compare-and-set update before giving up.
    pub conflict_retries: u32,
    /// Backoff for publishing outbound envelopes.
    pub publish_retry: RetryPolicy,
    /// How long idempotency keys outlive their saga.
    pub idempotency_retention: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::from_secs(30),
            sweep_interval: Duration::from_secs(1),
            conflict_retries: 3,
            publish_retry: RetryPolicy::default(),
            idempotency_retention: Duration::from_secs(3600),
        }
    }
}

/// Result of handling one step result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The transition was persisted. `unpublished` envelopes are still in the
    /// outbox because the bus could not take them.
    Applied { state: SagaState, unpublished: usize },
    /// The event had already been applied.
    Duplicate,
    /// The saga is terminal; the event was dropped.
    Discarded { state: SagaState },
}

/// Summary of a recovery pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records that were non-terminal or had an outbox.
    pub in_flight: usize,
    /// Outbox envelopes published.
    pub republished: usize,
    /// Outbox envelopes that still could not be published.
    pub unpublished: usize,
    /// Step deadlines re-armed.
    pub deadlines_armed: usize,
}

/// Per-saga async locks.
#[derive(Default)]
struct SagaLocks {
    locks: Mutex<HashMap<SagaId, Arc<Mutex<()>>>>,
}

impl SagaLocks {
    async fn get(&self, saga_id: SagaId) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(saga_id)
            .or_default()
            .clone()
    }

    /// Drops locks nobody holds.
    async fn prune(&self) {
        self.locks
            .lock()
            .await
            .retain(|_, lock| Arc::strong_count(lock) > 1);
    }
}

enum Attempt {
    Applied(SagaRecord),
    Discarded(SagaState),
}

/// Owns the saga state machine.
///
/// Every mutation goes through [`Orchestrator::handle_event`] (or
/// [`Orchestrator::start_saga`]), serialized per saga by an async lock and
/// persisted, together with its outbound envelopes, before anything is
/// published.
pub struct Orchestrator<S, B, I>
where
    S: SagaStore,
    B: EventBus,
    I: IdempotencyTracker,
{
    store: Arc<S>,
    bus: Arc<B>,
    tracker: Arc<I>,
    registry: Arc<SagaRegistry>,
    config: OrchestratorConfig,
    locks: SagaLocks,
    deadlines: Mutex<DeadlineTracker>,
    dead_letters: DeadLetterQueue,
    /// Sagas whose outbox the bus refused, with the envelope already
    /// dead-lettered for it, if any. The sweeper retries them.
    stalled: Mutex<HashMap<SagaId, Option<CorrelationId>>>,
}

impl<S, B, I> Orchestrator<S, B, I>
where
    S: SagaStore + 'static,
    B: EventBus + 'static,
    I: IdempotencyTracker + 'static,
{
    /// Creates a new orchestrator.
    pub fn new(
        store: Arc<S>,
        bus: Arc<B>,
        tracker: Arc<I>,
        registry: SagaRegistry,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            store,
            bus,
            tracker,
            registry: Arc::new(registry),
            config,
            locks: SagaLocks::default(),
            deadlines: Mutex::new(DeadlineTracker::new()),
            dead_letters: DeadLetterQueue::new(),
            stalled: Mutex::new(HashMap::new()),
        }
    }

    /// Shares a dead-letter queue with other consumers.
    pub fn with_dead_letters(mut self, dead_letters: DeadLetterQueue) -> Self {
        self.dead_letters = dead_letters;
        self
    }

    pub fn registry(&self) -> &SagaRegistry {
        &self.registry
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn dead_letters(&self) -> &DeadLetterQueue {
        &self.dead_letters
    }

    /// Returns the number of sagas with envelopes waiting for the bus.
    pub async fn stalled_outboxes(&self) -> usize {
        self.stalled.lock().await.len()
    }

    /// Returns the number of armed step deadlines.
    pub async fn pending_deadlines(&self) -> usize {
        self.deadlines.lock().await.len()
    }

    fn step_timeout(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.config.step_timeout)
            .unwrap_or_else(|_| chrono::Duration::seconds(30))
    }

    /// Starts a saga and publishes START.
    ///
    /// Returns the new saga ID. Fails with `DuplicateReferenceId` when a
    /// non-terminal saga of the same type already exists for the reference;
    /// nothing is created in that case.
    #[tracing::instrument(skip(self, payload), fields(saga_id))]
    pub async fn start_saga(
        &self,
        saga_type: &str,
        reference_id: &str,
        payload: Vec<u8>,
    ) -> Result<SagaId> {
        self.registry.require(saga_type)?;

        if self
            .store
            .find_active_by_reference(saga_type, reference_id)
            .await?
            .is_some()
        {
            return Err(SagaError::DuplicateReferenceId {
                saga_type: saga_type.to_string(),
                reference_id: reference_id.to_string(),
            });
        }

        let saga_id = SagaId::new();
        tracing::Span::current().record("saga_id", tracing::field::display(saga_id));

        let now = Utc::now();
        let deadline = now + self.step_timeout();
        let mut record = SagaRecord::new(saga_id, saga_type, reference_id, payload.clone(), now);
        record.record_history(EventType::Start, "", now);
        record.step_deadline = Some(deadline);
        record.outbox.push(Envelope {
            saga_id,
            saga_type: saga_type.to_string(),
            event_type: EventType::Start,
            step_name: String::new(),
            payload,
            correlation_id: CorrelationId::new(),
            timestamp: now,
        });

        // The store re-checks the reference atomically.
        self.store.insert(&record).await?;
        self.deadlines.lock().await.schedule(saga_id, deadline);

        metrics::counter!("saga_started_total", "saga_type" => saga_type.to_string()).increment(1);
        tracing::info!(saga_type, reference_id, "Saga started");

        let lock = self.locks.get(saga_id).await;
        let _guard = lock.lock().await;
        self.flush_outbox(&mut record).await?;

        Ok(saga_id)
    }

    /// Applies a participant result to its saga.
    ///
    /// This is the only way a running saga changes state. Duplicates are
    /// skipped, events for finished sagas are discarded, and anything the
    /// state machine does not accept fails with `UnexpectedTransition`
    /// without touching the record.
    #[tracing::instrument(
        skip(self, envelope),
        fields(
            saga_id = %envelope.saga_id,
            event_type = %envelope.event_type,
            step = %envelope.step_name,
        )
    )]
    pub async fn handle_event(&self, envelope: &Envelope) -> Result<HandleOutcome> {
        let lock = self.locks.get(envelope.saga_id).await;
        let _guard = lock.lock().await;
        self.handle_locked(envelope).await
    }

    async fn handle_locked(&self, envelope: &Envelope) -> Result<HandleOutcome> {
        let saga_id = envelope.saga_id;

        // Leftovers of an earlier transition go out before anything new.
        let mut record = self
            .store
            .load(saga_id)
            .await?
            .ok_or(SagaError::SagaNotFound(saga_id))?;
        if !record.outbox.is_empty() {
            self.flush_outbox(&mut record).await?;
        }

        // The key is claimed only once the transition is persisted. A crash
        // in between leaves it unclaimed, and the step check in the
        // transition rejects the redelivery instead.
        let key = IdempotencyKey::of(envelope);
        if self.tracker.is_applied(&key).await? {
            tracing::debug!("Duplicate event skipped");
            metrics::counter!("saga_duplicate_events_total").increment(1);
            return Ok(HandleOutcome::Duplicate);
        }

        let attempt = match self.apply_with_retry(envelope).await {
            Ok(attempt) => attempt,
            Err(e) => {
                if let SagaError::UnexpectedTransition { state, .. } = &e {
                    metrics::counter!("saga_unexpected_transitions_total").increment(1);
                    if *state == SagaState::Compensating && envelope.event_type == EventType::Failed
                    {
                        metrics::counter!("saga_compensation_failures_total").increment(1);
                        tracing::error!(
                            error = %e,
                            "Compensation failed, saga left COMPENSATING for an operator"
                        );
                    } else {
                        tracing::warn!(error = %e, "Unexpected transition, event dropped");
                    }
                }
                return Err(e);
            }
        };

        let mut record = match attempt {
            Attempt::Discarded(state) => {
                tracing::info!(%state, "Saga already finished, event discarded");
                return Ok(HandleOutcome::Discarded { state });
            }
            Attempt::Applied(record) => record,
        };
        self.tracker.try_apply(&key).await?;

        metrics::counter!(
            "saga_events_handled_total",
            "event_type" => envelope.event_type.as_str()
        )
        .increment(1);

        {
            let mut deadlines = self.deadlines.lock().await;
            match record.step_deadline {
                Some(deadline) if record.state.is_awaiting_step() => {
                    deadlines.schedule(saga_id, deadline)
                }
                _ => {
                    deadlines.cancel(saga_id);
                }
            }
        }

        let unpublished = self.flush_outbox(&mut record).await?;

        if record.is_terminal() {
            self.finish(&record).await?;
        } else {
            tracing::info!(state = %record.state, "Saga advanced");
        }

        Ok(HandleOutcome::Applied {
            state: record.state,
            unpublished,
        })
    }

    async fn apply_with_retry(&self, envelope: &Envelope) -> Result<Attempt> {
        let saga_id = envelope.saga_id;
        let attempts = self.config.conflict_retries.max(1);
        let mut last_state = SagaState::default();

        for attempt in 1..=attempts {
            let mut record = self
                .store
                .load(saga_id)
                .await?
                .ok_or(SagaError::SagaNotFound(saga_id))?;
            last_state = record.state;
            let definition = self.registry.require(&record.saga_type)?;

            let expected = record.version;
            let now = Utc::now();
            let outbound =
                match transition::apply(&mut record, definition, envelope, now, self.step_timeout())
                {
                    Ok(outbound) => outbound,
                    Err(Rejection::Terminal(state)) => return Ok(Attempt::Discarded(state)),
                    Err(Rejection::Unexpected(reason)) => {
                        return Err(unexpected(envelope, record.state, reason));
                    }
                };
            record.outbox.extend(outbound);
            record.updated_at = now;

            match self.store.update(&record, expected).await {
                Ok(version) => {
                    record.version = version;
                    return Ok(Attempt::Applied(record));
                }
                Err(StoreError::Conflict { actual, .. }) => {
                    tracing::debug!(attempt, %expected, %actual, "Saga record changed, retrying");
                    metrics::counter!("saga_store_conflicts_total").increment(1);
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(unexpected(
            envelope,
            last_state,
            format!("gave up after {attempts} conflicting updates"),
        ))
    }

    async fn finish(&self, record: &SagaRecord) -> Result<()> {
        let now = Utc::now();
        self.tracker.mark_terminal(record.saga_id, now).await?;

        let duration = (now - record.created_at).to_std().unwrap_or_default();
        metrics::histogram!("saga_duration_seconds", "saga_type" => record.saga_type.clone())
            .record(duration.as_secs_f64());

        match record.state {
            SagaState::Completed => {
                metrics::counter!("saga_completed_total", "saga_type" => record.saga_type.clone())
                    .increment(1);
                tracing::info!(
                    saga_type = %record.saga_type,
                    duration_ms = duration.as_millis() as u64,
                    "Saga completed"
                );
            }
            _ => {
                metrics::counter!("saga_failed_total", "saga_type" => record.saga_type.clone())
                    .increment(1);
                tracing::warn!(
                    saga_type = %record.saga_type,
                    compensated = record.completed_steps.len(),
                    duration_ms = duration.as_millis() as u64,
                    "Saga failed"
                );
            }
        }
        Ok(())
    }

    /// Publishes the record's outbox in order and clears what went out.
    ///
    /// Stops at the first envelope the bus refuses even after retries. That
    /// envelope is dead-lettered once, and it and everything after it stay
    /// in the outbox for the sweeper. Returns the number of envelopes left.
    async fn flush_outbox(&self, record: &mut SagaRecord) -> Result<usize> {
        if record.outbox.is_empty() {
            self.stalled.lock().await.remove(&record.saga_id);
            return Ok(0);
        }

        let mut published = Vec::new();
        for envelope in &record.outbox {
            match publish_with_retry(self.bus.as_ref(), envelope, &self.config.publish_retry).await
            {
                Ok(_) => published.push(envelope.correlation_id),
                Err(e) => {
                    self.stall(envelope, &e).await;
                    break;
                }
            }
        }

        if published.is_empty() {
            return Ok(record.outbox.len());
        }

        for attempt in 1..=self.config.conflict_retries.max(1) {
            let mut updated = record.clone();
            updated
                .outbox
                .retain(|e| !published.contains(&e.correlation_id));
            updated.updated_at = Utc::now();

            match self.store.update(&updated, record.version).await {
                Ok(version) => {
                    updated.version = version;
                    *record = updated;
                    if record.outbox.is_empty() {
                        self.stalled.lock().await.remove(&record.saga_id);
                    }
                    return Ok(record.outbox.len());
                }
                Err(StoreError::Conflict { .. }) => {
                    tracing::debug!(attempt, saga_id = %record.saga_id, "Outbox clear conflicted, reloading");
                    *record = self
                        .store
                        .load(record.saga_id)
                        .await?
                        .ok_or(SagaError::SagaNotFound(record.saga_id))?;
                }
                Err(e) => return Err(e.into()),
            }
        }

        // Published but still recorded: a later flush republishes them and
        // consumers drop the duplicates.
        tracing::warn!(saga_id = %record.saga_id, "Could not clear published outbox entries");
        self.stalled
            .lock()
            .await
            .entry(record.saga_id)
            .or_insert(None);
        Ok(record.outbox.len())
    }

    /// Marks a saga's outbox for retry and dead-letters the refused envelope
    /// the first time it is refused.
    async fn stall(&self, envelope: &Envelope, error: &BusError) {
        let previous = self
            .stalled
            .lock()
            .await
            .insert(envelope.saga_id, Some(envelope.correlation_id));
        if previous == Some(Some(envelope.correlation_id)) {
            tracing::debug!(
                saga_id = %envelope.saga_id,
                event_type = %envelope.event_type,
                error = %error,
                "Outbox still blocked"
            );
            return;
        }

        tracing::error!(
            saga_id = %envelope.saga_id,
            event_type = %envelope.event_type,
            step = %envelope.step_name,
            error = %error,
            "Outbox publish failed, envelope dead-lettered and kept for retry"
        );
        let attempts = match error {
            BusError::RetriesExhausted { attempts, .. } => *attempts,
            _ => 1,
        };
        let bytes = envelope::encode(envelope).unwrap_or_default();
        self.dead_letters
            .push(DeadLetter::undeliverable(bytes, attempts, error.to_string()))
            .await;
    }

    /// Publishes the outboxes the bus refused earlier.
    ///
    /// Returns the number of envelopes still waiting.
    pub async fn retry_outboxes(&self) -> Result<usize> {
        let pending: Vec<SagaId> = self.stalled.lock().await.keys().copied().collect();
        let mut left = 0;

        for saga_id in pending {
            let lock = self.locks.get(saga_id).await;
            let _guard = lock.lock().await;

            match self.store.load(saga_id).await? {
                Some(mut record) => {
                    let remaining = self.flush_outbox(&mut record).await?;
                    if remaining == 0 {
                        tracing::info!(%saga_id, "Stalled outbox published");
                    }
                    left += remaining;
                }
                None => {
                    self.stalled.lock().await.remove(&saga_id);
                }
            }
        }
        Ok(left)
    }

    /// Returns a saga record.
    pub async fn get_saga(&self, saga_id: SagaId) -> Result<Option<SagaRecord>> {
        Ok(self.store.load(saga_id).await?)
    }

    /// Returns a saga's history, oldest first.
    pub async fn history(&self, saga_id: SagaId) -> Result<Vec<HistoryEntry>> {
        Ok(self.store.history(saga_id).await?)
    }

    /// Lists sagas.
    pub async fn list(&self, query: SagaQuery) -> Result<Vec<SagaRecord>> {
        Ok(self.store.query(query).await?)
    }

    /// Replays persisted outboxes and rebuilds step deadlines.
    ///
    /// Must run before the orchestrator consumes new input after a restart.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        self.deadlines.lock().await.clear();

        let mut records = self.store.stream_in_flight().await?;
        while let Some(record) = records.next().await {
            let mut record = record?;
            report.in_flight += 1;

            if record.state.is_awaiting_step()
                && let Some(deadline) = record.step_deadline
            {
                self.deadlines
                    .lock()
                    .await
                    .schedule(record.saga_id, deadline);
                report.deadlines_armed += 1;
            }

            if !record.outbox.is_empty() {
                let lock = self.locks.get(record.saga_id).await;
                let _guard = lock.lock().await;
                let before = record.outbox.len();
                let left = self.flush_outbox(&mut record).await?;
                report.republished += before - left;
                report.unpublished += left;
            }

            if record.is_terminal() {
                self.tracker
                    .mark_terminal(record.saga_id, record.updated_at)
                    .await?;
            }
        }

        tracing::info!(
            in_flight = report.in_flight,
            republished = report.republished,
            unpublished = report.unpublished,
            deadlines_armed = report.deadlines_armed,
            "Recovery finished"
        );
        Ok(report)
    }

    /// Fails every forward step whose deadline is at or before `now`.
    ///
    /// The synthesized FAILED goes through the normal event path, so a late
    /// FAILED from the participant is a duplicate and a late STEP_COMPLETED
    /// is rejected. Returns the sagas that were failed.
    #[tracing::instrument(skip(self))]
    pub async fn check_timeouts(&self, now: DateTime<Utc>) -> Result<Vec<SagaId>> {
        let expired = self.deadlines.lock().await.expired(now);
        let mut timed_out = Vec::new();

        for saga_id in expired {
            let lock = self.locks.get(saga_id).await;
            let _guard = lock.lock().await;

            let Some(mut record) = self.store.load(saga_id).await? else {
                continue;
            };
            if !record.state.is_awaiting_step() {
                continue;
            }
            match record.step_deadline {
                Some(deadline) if deadline > now => {
                    self.deadlines.lock().await.schedule(saga_id, deadline);
                    continue;
                }
                None => continue,
                Some(_) => {}
            }

            let definition = self.registry.require(&record.saga_type)?;
            let Some(step) = definition.step(record.current_step_index) else {
                continue;
            };

            // A command the bus never took must not reach the participant
            // after its step has been failed.
            let first_step = record.current_step_index == 0;
            let is_stale = |e: &Envelope| match e.event_type {
                EventType::Start => first_step,
                EventType::Step => e.step_name == step,
                _ => false,
            };
            if record.outbox.iter().any(is_stale) {
                let expected = record.version;
                let dropped = record.outbox.len();
                record.outbox.retain(|e| !is_stale(e));
                record.updated_at = Utc::now();
                self.store.update(&record, expected).await?;
                tracing::warn!(
                    %saga_id,
                    step,
                    dropped = dropped - record.outbox.len(),
                    "Unpublished command for timed-out step dropped"
                );
            }

            let failure = Envelope {
                saga_id,
                saga_type: record.saga_type.clone(),
                event_type: EventType::Failed,
                step_name: step.to_string(),
                payload: StepFailure::new(
                    step,
                    format!("no result within {}ms", self.config.step_timeout.as_millis()),
                )
                .to_payload(),
                correlation_id: CorrelationId::new(),
                timestamp: now,
            };

            tracing::warn!(%saga_id, step, "Step timed out");
            metrics::counter!("saga_timeouts_total").increment(1);

            match self.handle_locked(&failure).await {
                Ok(HandleOutcome::Applied { .. }) => timed_out.push(saga_id),
                Ok(_) => {}
                Err(e) => tracing::error!(%saga_id, error = %e, "Could not fail timed-out step"),
            }
        }

        Ok(timed_out)
    }

    /// Recovers, then consumes step results until shutdown.
    ///
    /// One worker per partition keeps each saga's events in order; a sweeper
    /// task runs [`Orchestrator::sweep`].
    pub async fn run(self: Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        // Subscribe first so nothing published during recovery is missed.
        let subscription = self.bus.subscribe(ORCHESTRATOR_GROUP).await?;
        self.recover().await?;

        tracing::info!(
            partitions = subscription.partition_count(),
            "Orchestrator consuming"
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

        let this = self.clone();
        let mut sweeper_shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(this.config.sweep_interval);
            loop {
                tokio::select! {
                    _ = sweeper_shutdown.changed() => break,
                    _ = interval.tick() => this.sweep().await,
                }
            }
        }));

        for worker in workers {
            if let Err(e) = worker.await {
                tracing::error!(error = %e, "Orchestrator worker panicked");
            }
        }
        tracing::info!("Orchestrator stopped");
        Ok(())
    }

    /// One pass of the sweeper: deadlines, then stalled outboxes, then
    /// idempotency keys and idle locks.
    pub async fn sweep(&self) {
        let now = Utc::now();
        if let Err(e) = self.check_timeouts(now).await {
            tracing::error!(error = %e, "Timeout sweep failed");
        }

        match self.retry_outboxes().await {
            Ok(0) => {}
            Ok(left) => tracing::warn!(left, "Outbox envelopes still waiting for the bus"),
            Err(e) => tracing::error!(error = %e, "Outbox retry failed"),
        }

        let retention = chrono::Duration::from_std(self.config.idempotency_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(1));
        match self.tracker.collect_garbage(now, retention).await {
            Ok(0) => {}
            Ok(removed) => tracing::debug!(removed, "Idempotency keys collected"),
            Err(e) => tracing::error!(error = %e, "Idempotency garbage collection failed"),
        }

        self.locks.prune().await;
    }

    async fn consume(&self, payload: Vec<u8>) {
        let envelope = match envelope::decode(&payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(error = %e, "Undecodable envelope");
                self.dead_letters
                    .push(DeadLetter::rejected(payload, ORCHESTRATOR_GROUP, e.to_string()))
                    .await;
                return;
            }
        };

        // Commands and terminal notices are our own output.
        if !envelope.is_step_result() {
            return;
        }

        match self.handle_event(&envelope).await {
            Ok(outcome) => tracing::debug!(?outcome, "Event handled"),
            // Logged and counted where it was raised.
            Err(SagaError::UnexpectedTransition { .. }) => {}
            Err(SagaError::SagaNotFound(saga_id)) => {
                tracing::warn!(%saga_id, event_type = %envelope.event_type, "Event for unknown saga dropped");
            }
            Err(e) => {
                tracing::error!(
                    saga_id = %envelope.saga_id,
                    event_type = %envelope.event_type,
                    error = %e,
                    "Event handling failed"
                );
                self.dead_letters
                    .push(DeadLetter::rejected(payload, ORCHESTRATOR_GROUP, e.to_string()))
                    .await;
            }
        }
    }
}

fn unexpected(envelope: &Envelope, state: SagaState, reason: String) -> SagaError {
    SagaError::UnexpectedTransition {
        saga_id: envelope.saga_id,
        state,
        event_type: envelope.event_type,
        step_name: envelope.step_name.clone(),
        reason,
    }
}

//! Notification service: tells users how their saga ended.

use std::fmt;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::SagaId;
use envelope::{Envelope, EventType};
use serde::{Deserialize, Serialize};

use crate::definition::{ACCOUNT_CREATION, PAYMENT_TRANSFER};
use crate::error::Result;
use crate::participant::{SagaObserver, StepFailure};
use crate::participants::account::{Account, BalancesUpdated};

/// Kind of a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NotificationKind {
    AccountOpened,
    PaymentProcessed,
    PaymentFailed,
    SagaFailed,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            NotificationKind::AccountOpened => "ACCOUNT_OPENED",
            NotificationKind::PaymentProcessed => "PAYMENT_PROCESSED",
            NotificationKind::PaymentFailed => "PAYMENT_FAILED",
            NotificationKind::SagaFailed => "SAGA_FAILED",
        };
        write!(f, "{s}")
    }
}

/// A stored notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub recipient: Option<String>,
    pub kind: NotificationKind,
    pub message: String,
    pub reference: String,
    pub saga_id: SagaId,
    pub created_at: DateTime<Utc>,
}

/// Trait for notification delivery.
#[async_trait]
pub trait NotificationService: Send + Sync {
    async fn send(&self, notification: Notification) -> Result<()>;
}

/// In-memory notification service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryNotificationService {
    sent: Arc<RwLock<Vec<Notification>>>,
}

impl InMemoryNotificationService {
    /// Creates a new in-memory notification service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the number of notifications sent.
    pub fn sent_count(&self) -> usize {
        self.sent.read().unwrap().len()
    }

    /// Returns the notifications sent for a saga.
    pub fn sent_for(&self, saga_id: SagaId) -> Vec<Notification> {
        self.sent
            .read()
            .unwrap()
            .iter()
            .filter(|n| n.saga_id == saga_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationService for InMemoryNotificationService {
    async fn send(&self, notification: Notification) -> Result<()> {
        self.sent.write().unwrap().push(notification);
        Ok(())
    }
}

/// Turns COMPLETED and terminal FAILED envelopes into notifications.
pub struct SagaNotifier {
    notifications: Arc<dyn NotificationService>,
}

impl SagaNotifier {
    pub fn new(notifications: Arc<dyn NotificationService>) -> Self {
        Self { notifications }
    }

    fn render(envelope: &Envelope) -> Result<Option<Notification>> {
        let notification = |recipient, kind, message, reference| Notification {
            recipient,
            kind,
            message,
            reference,
            saga_id: envelope.saga_id,
            created_at: Utc::now(),
        };

        let rendered = match (envelope.saga_type.as_str(), envelope.event_type) {
            (ACCOUNT_CREATION, EventType::Completed) => {
                let account: Account = envelope.decode_payload()?;
                notification(
                    Some(account.username.clone()),
                    NotificationKind::AccountOpened,
                    format!(
                        "Welcome {}, your new {} account (Account Number: {}) has been created with an initial balance of ${:.2}.",
                        account.full_name, account.account_type, account.account_number, account.balance
                    ),
                    account.account_number,
                )
            }
            (PAYMENT_TRANSFER, EventType::Completed) => {
                let updated: BalancesUpdated = envelope.decode_payload()?;
                notification(
                    Some(updated.username.clone()),
                    NotificationKind::PaymentProcessed,
                    format!(
                        "Dear {}, your payment of ${:.2} has been successfully processed. Payment ID: {}.",
                        updated.username, updated.amount, updated.payment_id
                    ),
                    updated.payment_id,
                )
            }
            (saga_type, EventType::Failed) => {
                let failure = envelope
                    .decode_payload::<StepFailure>()
                    .unwrap_or_else(|_| StepFailure::new("", "unknown reason"));
                let (kind, message) = if saga_type == PAYMENT_TRANSFER {
                    (
                        NotificationKind::PaymentFailed,
                        format!(
                            "Your payment could not be processed. Reason: {}",
                            failure.reason
                        ),
                    )
                } else {
                    (
                        NotificationKind::SagaFailed,
                        format!(
                            "{saga_type} failed at step '{}': {}",
                            failure.step, failure.reason
                        ),
                    )
                };
                notification(None, kind, message, envelope.saga_id.to_string())
            }
            _ => return Ok(None),
        };
        Ok(Some(rendered))
    }
}

#[async_trait]
impl SagaObserver for SagaNotifier {
    async fn observe(&self, envelope: &Envelope) -> Result<()> {
        let Some(notification) = Self::render(envelope)? else {
            tracing::debug!(saga_type = %envelope.saga_type, "Nothing to notify");
            return Ok(());
        };
        tracing::info!(
            kind = %notification.kind,
            recipient = ?notification.recipient,
            "{}",
            notification.message
        );
        self.notifications.send(notification).await
    }
}

//! Payment service trait and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use envelope::Envelope;
use serde::{Deserialize, Serialize};

use crate::definition::STEP_INITIATE_PAYMENT;
use crate::error::{Result, SagaError};
use crate::participant::StepHandler;

/// Start payload of a payment transfer saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferPayload {
    pub username: String,
    pub source_account_number: String,
    pub destination_account_number: String,
    pub amount: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

/// A recorded payment. Output of `initiate_payment`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentInitiated {
    pub payment_id: String,
    pub username: String,
    pub source_account_number: String,
    pub destination_account_number: String,
    pub amount: f64,
    pub currency: String,
}

/// Trait for payment processing operations.
#[async_trait]
pub trait PaymentService: Send + Sync {
    /// Records a payment for a transfer.
    async fn initiate(&self, transfer: &TransferPayload) -> Result<PaymentInitiated>;

    /// Cancels a previously recorded payment.
    async fn cancel(&self, payment_id: &str) -> Result<()>;
}

#[derive(Debug, Default)]
struct InMemoryPaymentState {
    payments: HashMap<String, PaymentInitiated>,
    next_id: u32,
    fail_on_initiate: bool,
}

/// In-memory payment service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPaymentService {
    state: Arc<RwLock<InMemoryPaymentState>>,
}

impl InMemoryPaymentService {
    /// Creates a new in-memory payment service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configures the service to fail on the next initiate call.
    pub fn set_fail_on_initiate(&self, fail: bool) {
        self.state.write().unwrap().fail_on_initiate = fail;
    }

    /// Returns the number of active payments.
    pub fn payment_count(&self) -> usize {
        self.state.read().unwrap().payments.len()
    }

    /// Returns true if a payment exists with the given ID.
    pub fn has_payment(&self, payment_id: &str) -> bool {
        self.state.read().unwrap().payments.contains_key(payment_id)
    }
}

#[async_trait]
impl PaymentService for InMemoryPaymentService {
    async fn initiate(&self, transfer: &TransferPayload) -> Result<PaymentInitiated> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_initiate {
            return Err(SagaError::action_failed(
                STEP_INITIATE_PAYMENT,
                "Payment declined",
            ));
        }
        if transfer.amount <= 0.0 {
            return Err(SagaError::action_failed(
                STEP_INITIATE_PAYMENT,
                format!("Invalid amount {}", transfer.amount),
            ));
        }

        state.next_id += 1;
        let payment = PaymentInitiated {
            payment_id: format!("PAY-{:04}", state.next_id),
            username: transfer.username.clone(),
            source_account_number: transfer.source_account_number.clone(),
            destination_account_number: transfer.destination_account_number.clone(),
            amount: transfer.amount,
            currency: transfer.currency.clone(),
        };
        state
            .payments
            .insert(payment.payment_id.clone(), payment.clone());

        Ok(payment)
    }

    async fn cancel(&self, payment_id: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        state.payments.remove(payment_id);
        Ok(())
    }
}

/// `initiate_payment` step of PAYMENT_TRANSFER.
pub struct InitiatePaymentStep {
    payments: Arc<dyn PaymentService>,
}

impl InitiatePaymentStep {
    pub fn new(payments: Arc<dyn PaymentService>) -> Self {
        Self { payments }
    }
}

#[async_trait]
impl StepHandler for InitiatePaymentStep {
    async fn execute(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let transfer: TransferPayload = envelope.decode_payload()?;
        let payment = self.payments.initiate(&transfer).await?;
        tracing::info!(
            payment_id = %payment.payment_id,
            amount = payment.amount,
            "Payment initiated"
        );
        Ok(serde_json::to_vec(&payment)?)
    }

    async fn compensate(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let payment: PaymentInitiated = envelope.decode_payload()?;
        self.payments.cancel(&payment.payment_id).await?;
        tracing::info!(payment_id = %payment.payment_id, "Payment cancelled");
        Ok(Vec::new())
    }
}

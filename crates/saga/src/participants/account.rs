//! Account service: opens accounts and moves balances.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use envelope::Envelope;
use serde::{Deserialize, Serialize};

use crate::definition::{STEP_CREATE_ACCOUNT, STEP_UPDATE_BALANCES};
use crate::error::{Result, SagaError};
use crate::participant::StepHandler;
use crate::participants::payment::PaymentInitiated;

/// Start payload of an account creation saga.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountPayload {
    pub user_id: String,
    pub username: String,
    pub full_name: String,
    pub account_type: String,
    #[serde(default)]
    pub initial_balance: f64,
}

/// Account lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountStatus {
    Active,
    Closed,
}

/// An opened account. Output of `create_account`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Account {
    pub account_number: String,
    pub user_id: String,
    pub username: String,
    pub full_name: String,
    pub account_type: String,
    pub balance: f64,
    pub status: AccountStatus,
}

/// Output of `update_balances`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancesUpdated {
    pub payment_id: String,
    pub username: String,
    pub source_account_number: String,
    pub destination_account_number: String,
    pub amount: f64,
    pub currency: String,
    pub source_balance: f64,
    pub destination_balance: f64,
}

/// Trait for account operations.
#[async_trait]
pub trait AccountService: Send + Sync {
    /// Opens an account and assigns its number.
    async fn create_account(&self, payload: &AccountPayload) -> Result<Account>;

    /// Closes an account.
    async fn close_account(&self, account_number: &str) -> Result<()>;

    /// Moves `amount` from `source` to `destination`. Returns both new balances.
    async fn transfer(&self, source: &str, destination: &str, amount: f64) -> Result<(f64, f64)>;
}

#[derive(Debug, Default)]
struct InMemoryAccountState {
    accounts: HashMap<String, Account>,
    next_id: u32,
    fail_on_create: bool,
}

/// In-memory account service for testing.
#[derive(Debug, Clone, Default)]
pub struct InMemoryAccountService {
    state: Arc<RwLock<InMemoryAccountState>>,
}

impl InMemoryAccountService {
    /// Creates a new in-memory account service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens an account directly, outside any saga.
    pub fn open_account(&self, username: &str, balance: f64) -> String {
        let mut state = self.state.write().unwrap();
        state.next_id += 1;
        let account_number = format!("ACC-{:04}", state.next_id);
        state.accounts.insert(
            account_number.clone(),
            Account {
                account_number: account_number.clone(),
                user_id: username.to_string(),
                username: username.to_string(),
                full_name: username.to_string(),
                account_type: "CHECKING".to_string(),
                balance,
                status: AccountStatus::Active,
            },
        );
        account_number
    }

    /// Configures the service to fail on the next create call.
    pub fn set_fail_on_create(&self, fail: bool) {
        self.state.write().unwrap().fail_on_create = fail;
    }

    /// Returns the number of active accounts.
    pub fn active_count(&self) -> usize {
        self.state
            .read()
            .unwrap()
            .accounts
            .values()
            .filter(|a| a.status == AccountStatus::Active)
            .count()
    }

    pub fn account(&self, account_number: &str) -> Option<Account> {
        self.state.read().unwrap().accounts.get(account_number).cloned()
    }

    pub fn balance(&self, account_number: &str) -> Option<f64> {
        self.account(account_number).map(|a| a.balance)
    }
}

#[async_trait]
impl AccountService for InMemoryAccountService {
    async fn create_account(&self, payload: &AccountPayload) -> Result<Account> {
        let mut state = self.state.write().unwrap();

        if state.fail_on_create {
            return Err(SagaError::action_failed(
                STEP_CREATE_ACCOUNT,
                "Account service unavailable",
            ));
        }
        if payload.initial_balance < 0.0 {
            return Err(SagaError::action_failed(
                STEP_CREATE_ACCOUNT,
                "Initial balance cannot be negative",
            ));
        }

        state.next_id += 1;
        let account = Account {
            account_number: format!("ACC-{:04}", state.next_id),
            user_id: payload.user_id.clone(),
            username: payload.username.clone(),
            full_name: payload.full_name.clone(),
            account_type: payload.account_type.clone(),
            balance: payload.initial_balance,
            status: AccountStatus::Active,
        };
        state
            .accounts
            .insert(account.account_number.clone(), account.clone());

        Ok(account)
    }

    async fn close_account(&self, account_number: &str) -> Result<()> {
        let mut state = self.state.write().unwrap();
        if let Some(account) = state.accounts.get_mut(account_number) {
            account.status = AccountStatus::Closed;
        }
        Ok(())
    }

    async fn transfer(&self, source: &str, destination: &str, amount: f64) -> Result<(f64, f64)> {
        let mut state = self.state.write().unwrap();

        let active = |state: &InMemoryAccountState, number: &str| {
            state
                .accounts
                .get(number)
                .filter(|a| a.status == AccountStatus::Active)
                .map(|a| a.balance)
                .ok_or_else(|| {
                    SagaError::action_failed(
                        STEP_UPDATE_BALANCES,
                        format!("Account {number} not found"),
                    )
                })
        };
        let source_balance = active(&state, source)?;
        active(&state, destination)?;

        if source_balance < amount {
            return Err(SagaError::action_failed(
                STEP_UPDATE_BALANCES,
                format!("Insufficient funds in account {source}"),
            ));
        }

        let mut balances = (0.0, 0.0);
        if let Some(account) = state.accounts.get_mut(source) {
            account.balance -= amount;
            balances.0 = account.balance;
        }
        if let Some(account) = state.accounts.get_mut(destination) {
            account.balance += amount;
            balances.1 = account.balance;
        }
        Ok(balances)
    }
}

/// `create_account` step of ACCOUNT_CREATION.
pub struct CreateAccountStep {
    accounts: Arc<dyn AccountService>,
}

impl CreateAccountStep {
    pub fn new(accounts: Arc<dyn AccountService>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl StepHandler for CreateAccountStep {
    async fn execute(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let payload: AccountPayload = envelope.decode_payload()?;
        let account = self.accounts.create_account(&payload).await?;
        tracing::info!(
            account_number = %account.account_number,
            username = %account.username,
            "Account created"
        );
        Ok(serde_json::to_vec(&account)?)
    }

    async fn compensate(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let account: Account = envelope.decode_payload()?;
        self.accounts.close_account(&account.account_number).await?;
        tracing::info!(account_number = %account.account_number, "Account closed");
        Ok(Vec::new())
    }
}

/// `update_balances` step of PAYMENT_TRANSFER.
pub struct UpdateBalancesStep {
    accounts: Arc<dyn AccountService>,
}

impl UpdateBalancesStep {
    pub fn new(accounts: Arc<dyn AccountService>) -> Self {
        Self { accounts }
    }
}

#[async_trait]
impl StepHandler for UpdateBalancesStep {
    async fn execute(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let payment: PaymentInitiated = envelope.decode_payload()?;
        let (source_balance, destination_balance) = self
            .accounts
            .transfer(
                &payment.source_account_number,
                &payment.destination_account_number,
                payment.amount,
            )
            .await?;

        let updated = BalancesUpdated {
            payment_id: payment.payment_id,
            username: payment.username,
            source_account_number: payment.source_account_number,
            destination_account_number: payment.destination_account_number,
            amount: payment.amount,
            currency: payment.currency,
            source_balance,
            destination_balance,
        };
        Ok(serde_json::to_vec(&updated)?)
    }

    async fn compensate(&self, envelope: &Envelope) -> Result<Vec<u8>> {
        let updated: BalancesUpdated = envelope.decode_payload()?;
        self.accounts
            .transfer(
                &updated.destination_account_number,
                &updated.source_account_number,
                updated.amount,
            )
            .await?;
        tracing::info!(payment_id = %updated.payment_id, "Transfer reversed");
        Ok(Vec::new())
    }
}

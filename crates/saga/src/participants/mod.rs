//! Account, payment and notification participants.

pub mod account;
pub mod notification;
pub mod payment;

use std::sync::Arc;

pub use account::{
    Account, AccountPayload, AccountService, AccountStatus, BalancesUpdated, CreateAccountStep,
    InMemoryAccountService, UpdateBalancesStep,
};
pub use notification::{
    InMemoryNotificationService, Notification, NotificationKind, NotificationService,
    SagaNotifier,
};
pub use payment::{
    InMemoryPaymentService, InitiatePaymentStep, PaymentInitiated, PaymentService,
    TransferPayload,
};

use envelope::SchemaRegistry;

use crate::definition::{
    ACCOUNT_CREATION, PAYMENT_TRANSFER, STEP_CREATE_ACCOUNT, STEP_INITIATE_PAYMENT,
    STEP_UPDATE_BALANCES, SagaRegistry,
};
use crate::error::Result;
use crate::participant::HandlerRegistry;

/// Handlers of the account service.
pub fn account_handlers(
    sagas: &SagaRegistry,
    accounts: Arc<dyn AccountService>,
) -> Result<HandlerRegistry> {
    let mut handlers = HandlerRegistry::new();
    handlers.register_step(
        sagas.require(ACCOUNT_CREATION)?,
        STEP_CREATE_ACCOUNT,
        Arc::new(CreateAccountStep::new(accounts.clone())),
    )?;
    handlers.register_step(
        sagas.require(PAYMENT_TRANSFER)?,
        STEP_UPDATE_BALANCES,
        Arc::new(UpdateBalancesStep::new(accounts)),
    )?;
    Ok(handlers)
}

/// Handlers of the payment service.
pub fn payment_handlers(
    sagas: &SagaRegistry,
    payments: Arc<dyn PaymentService>,
) -> Result<HandlerRegistry> {
    let mut handlers = HandlerRegistry::new();
    handlers.register_step(
        sagas.require(PAYMENT_TRANSFER)?,
        STEP_INITIATE_PAYMENT,
        Arc::new(InitiatePaymentStep::new(payments)),
    )?;
    Ok(handlers)
}

/// Observers of the notification service.
pub fn notification_handlers(
    sagas: &SagaRegistry,
    notifications: Arc<dyn NotificationService>,
) -> HandlerRegistry {
    let notifier = Arc::new(SagaNotifier::new(notifications));
    let mut handlers = HandlerRegistry::new();
    for saga_type in sagas.saga_types() {
        handlers.register_observer(saga_type, notifier.clone());
    }
    handlers
}

/// Payload schemas of the commands the standard participants execute.
pub fn command_schemas() -> SchemaRegistry {
    let mut schemas = SchemaRegistry::new();
    schemas.register::<AccountPayload>(ACCOUNT_CREATION, "");
    schemas.register::<TransferPayload>(PAYMENT_TRANSFER, "");
    schemas.register::<PaymentInitiated>(PAYMENT_TRANSFER, STEP_UPDATE_BALANCES);
    schemas
}

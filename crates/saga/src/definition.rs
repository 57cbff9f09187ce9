//! Saga definitions: the ordered steps each saga type runs.

use std::collections::HashMap;

use crate::error::{Result, SagaError};

/// Saga type: open an account for a user.
pub const ACCOUNT_CREATION: &str = "ACCOUNT_CREATION";

/// Saga type: move money between two accounts.
pub const PAYMENT_TRANSFER: &str = "PAYMENT_TRANSFER";

/// Step name: create the account.
pub const STEP_CREATE_ACCOUNT: &str = "create_account";

/// Step name: record the payment.
pub const STEP_INITIATE_PAYMENT: &str = "initiate_payment";

/// Step name: debit the source account and credit the destination.
pub const STEP_UPDATE_BALANCES: &str = "update_balances";

/// The ordered steps of one saga type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SagaDefinition {
    saga_type: String,
    steps: Vec<String>,
}

impl SagaDefinition {
    /// Creates a definition. Fails if there are no steps or a step repeats.
    pub fn new<S: Into<String>>(
        saga_type: impl Into<String>,
        steps: impl IntoIterator<Item = S>,
    ) -> Result<Self> {
        let saga_type = saga_type.into();
        let steps: Vec<String> = steps.into_iter().map(Into::into).collect();

        if steps.is_empty() {
            return Err(SagaError::InvalidDefinition(format!(
                "{saga_type} has no steps"
            )));
        }
        for (i, step) in steps.iter().enumerate() {
            if step.is_empty() {
                return Err(SagaError::InvalidDefinition(format!(
                    "{saga_type} has an unnamed step"
                )));
            }
            if steps[..i].contains(step) {
                return Err(SagaError::InvalidDefinition(format!(
                    "{saga_type} lists step '{step}' twice"
                )));
            }
        }

        Ok(Self { saga_type, steps })
    }

    pub fn saga_type(&self) -> &str {
        &self.saga_type
    }

    pub fn steps(&self) -> &[String] {
        &self.steps
    }

    /// Returns the step at `index`, if any.
    pub fn step(&self, index: usize) -> Option<&str> {
        self.steps.get(index).map(String::as_str)
    }

    /// Returns the position of a step.
    pub fn index_of(&self, step_name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s == step_name)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

/// Definitions by saga type.
#[derive(Debug, Clone, Default)]
pub struct SagaRegistry {
    definitions: HashMap<String, SagaDefinition>,
}

impl SagaRegistry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The account creation and payment transfer sagas.
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.register(SagaDefinition {
            saga_type: ACCOUNT_CREATION.to_string(),
            steps: vec![STEP_CREATE_ACCOUNT.to_string()],
        });
        registry.register(SagaDefinition {
            saga_type: PAYMENT_TRANSFER.to_string(),
            steps: vec![
                STEP_INITIATE_PAYMENT.to_string(),
                STEP_UPDATE_BALANCES.to_string(),
            ],
        });
        registry
    }

    /// Registers a definition, replacing any previous one for its type.
    pub fn register(&mut self, definition: SagaDefinition) {
        self.definitions
            .insert(definition.saga_type.clone(), definition);
    }

    /// Looks up a definition.
    pub fn get(&self, saga_type: &str) -> Option<&SagaDefinition> {
        self.definitions.get(saga_type)
    }

    /// Looks up a definition, failing with `UnknownSagaType`.
    pub fn require(&self, saga_type: &str) -> Result<&SagaDefinition> {
        self.get(saga_type)
            .ok_or_else(|| SagaError::UnknownSagaType(saga_type.to_string()))
    }

    /// Returns the registered saga types, sorted.
    pub fn saga_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.definitions.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

//! Top-ups through a third-party payment processor.
//!
//! The processor owns card capture; this module only turns a confirmed
//! payment into exactly one ledger credit.
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use uuid::Uuid;

use crate::constants::{KEY_PAYMENT, LOG_PAYMENTS};
use crate::error::{EngineError, EngineResult};
use crate::ledger::{EntryKind, LedgerService, Posting, Receipt, idempotency_key};
use crate::money::Cents;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    RequiresPayment,
    Succeeded,
    Failed,
}

/// Handle returned to the client so it can complete payment with the processor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub intent_id: String,
    pub client_secret: String,
    pub user_id: String,
    pub amount: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfirmedPayment {
    pub intent_id: String,
    pub user_id: String,
    pub amount: Cents,
    pub status: PaymentStatus,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProcessorError {
    #[error("payment processor unreachable: {0}")]
    Unreachable(String),
    #[error("payment intent {0}")]
    UnknownIntent(String),
    #[error("payment rejected: {0}")]
    Rejected(String),
}

impl From<ProcessorError> for EngineError {
    fn from(err: ProcessorError) -> Self {
        match err {
            ProcessorError::Unreachable(_) => Self::Transient(err.to_string()),
            ProcessorError::UnknownIntent(_) => Self::NotFound(err.to_string()),
            ProcessorError::Rejected(_) => Self::Validation(err.to_string()),
        }
    }
}

/// Seam for the external processor.
pub trait PaymentProcessor: Send + Sync {
    /// Register an intent to collect `amount` from `user_id`.
    ///
    /// # Errors
    ///
    /// Returns an error if the processor rejects or cannot be reached.
    fn create_intent(&self, amount: Cents, user_id: &str) -> Result<PaymentIntent, ProcessorError>;

    /// Report the processor's view of an intent.
    ///
    /// # Errors
    ///
    /// Returns an error for unknown intents or an unreachable processor.
    fn confirm(&self, intent_id: &str) -> Result<ConfirmedPayment, ProcessorError>;
}

/// In-memory processor for local runs and QA drills.
#[derive(Debug, Default)]
pub struct SandboxProcessor {
    state: Mutex<SandboxState>,
}

#[derive(Debug, Default)]
struct SandboxState {
    intents: HashMap<String, ConfirmedPayment>,
    outages: u32,
}

impl SandboxProcessor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the player completing payment in the processor's UI.
    ///
    /// # Errors
    ///
    /// Returns `UnknownIntent` if the intent was never created.
    pub fn complete_payment(&self, intent_id: &str) -> Result<(), ProcessorError> {
        self.set_status(intent_id, PaymentStatus::Succeeded)
    }

    /// # Errors
    ///
    /// Returns `UnknownIntent` if the intent was never created.
    pub fn decline_payment(&self, intent_id: &str) -> Result<(), ProcessorError> {
        self.set_status(intent_id, PaymentStatus::Failed)
    }

    /// Make the next `calls` processor calls fail as unreachable.
    pub fn go_offline(&self, calls: u32) {
        if let Ok(mut state) = self.state.lock() {
            state.outages = state.outages.saturating_add(calls);
        }
    }

    fn set_status(&self, intent_id: &str, status: PaymentStatus) -> Result<(), ProcessorError> {
        let mut state = self.lock()?;
        let intent = state
            .intents
            .get_mut(intent_id)
            .ok_or_else(|| ProcessorError::UnknownIntent(intent_id.to_string()))?;
        intent.status = status;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, SandboxState>, ProcessorError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| ProcessorError::Unreachable("sandbox state poisoned".to_string()))?;
        if state.outages > 0 {
            state.outages -= 1;
            return Err(ProcessorError::Unreachable("sandbox offline".to_string()));
        }
        Ok(state)
    }
}

impl PaymentProcessor for SandboxProcessor {
    fn create_intent(&self, amount: Cents, user_id: &str) -> Result<PaymentIntent, ProcessorError> {
        let mut state = self.lock()?;
        let intent_id = format!("pi_{}", Uuid::new_v4().simple());
        let client_secret = format!("{intent_id}_secret_{}", Uuid::new_v4().simple());
        state.intents.insert(
            intent_id.clone(),
            ConfirmedPayment {
                intent_id: intent_id.clone(),
                user_id: user_id.to_string(),
                amount,
                status: PaymentStatus::RequiresPayment,
            },
        );
        Ok(PaymentIntent {
            intent_id,
            client_secret,
            user_id: user_id.to_string(),
            amount,
        })
    }

    fn confirm(&self, intent_id: &str) -> Result<ConfirmedPayment, ProcessorError> {
        let state = self.lock()?;
        state
            .intents
            .get(intent_id)
            .cloned()
            .ok_or_else(|| ProcessorError::UnknownIntent(intent_id.to_string()))
    }
}

/// Converts confirmed processor payments into ledger credits.
pub struct TopUpService {
    processor: Arc<dyn PaymentProcessor>,
    ledger: Arc<LedgerService>,
    min_top_up: Cents,
}

impl std::fmt::Debug for TopUpService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TopUpService")
            .field("min_top_up", &self.min_top_up)
            .finish_non_exhaustive()
    }
}

impl TopUpService {
    #[must_use]
    pub fn new(
        processor: Arc<dyn PaymentProcessor>,
        ledger: Arc<LedgerService>,
        min_top_up: Cents,
    ) -> Self {
        Self {
            processor,
            ledger,
            min_top_up,
        }
    }

    /// # Errors
    ///
    /// `Validation` below the minimum top-up, `NotFound` for an unknown
    /// account, `Transient` if the processor is unreachable.
    pub fn create_intent(&self, user_id: &str, amount: Cents) -> EngineResult<PaymentIntent> {
        if amount < self.min_top_up {
            return Err(EngineError::Validation(format!(
                "top-up must be at least {} cents (got {amount})",
                self.min_top_up
            )));
        }
        self.ledger.balance(user_id)?;
        let intent = self.processor.create_intent(amount, user_id)?;
        log::info!(
            target: LOG_PAYMENTS,
            "created intent {} for {user_id}: {amount} cents",
            intent.intent_id
        );
        Ok(intent)
    }

    /// Credit the account for a confirmed intent.
    ///
    /// Safe to call for every webhook delivery: the credit is keyed by intent.
    ///
    /// # Errors
    ///
    /// `Validation` when the processor has not confirmed the payment,
    /// `Transient` if it cannot be reached.
    pub fn confirm(&self, intent_id: &str) -> EngineResult<Receipt> {
        let payment = self.processor.confirm(intent_id)?;
        if payment.status != PaymentStatus::Succeeded {
            log::warn!(
                target: LOG_PAYMENTS,
                "intent {intent_id} is {:?}, not crediting",
                payment.status
            );
            return Err(EngineError::Validation(format!(
                "payment {intent_id} has not succeeded"
            )));
        }
        let receipt = self.ledger.post(Posting {
            user_id: &payment.user_id,
            amount: payment.amount,
            kind: EntryKind::Credit,
            reference_id: intent_id,
            idempotency_key: idempotency_key(KEY_PAYMENT, intent_id),
        })?;
        if !receipt.replayed {
            log::info!(
                target: LOG_PAYMENTS,
                "credited {} cents to {} for {intent_id}",
                payment.amount,
                payment.user_id
            );
        }
        Ok(receipt)
    }
}

//! Mission Crossable Engine
//!
//! Platform-agnostic core for the Mission Crossable push-your-luck wager.
//! The crate decides every step outcome and owns every balance mutation;
//! presentation layers only render confirmed results.

pub mod config;
pub mod constants;
pub mod error;
pub mod journal;
pub mod ledger;
pub mod money;
pub mod notify;
pub mod numbers;
pub mod payments;
pub mod risk;
pub mod session;

use std::sync::Arc;

use rand::RngCore;
use tokio::sync::broadcast;

// Re-export commonly used types
pub use config::{ConfigError, DifficultyCatalog, DifficultyProfile, RulesConfig, standard_catalog};
pub use error::{EngineError, EngineResult, ErrorClass};
pub use journal::{Journal, JournalError, MemoryJournal};
pub use ledger::{Account, AuditReport, EntryKind, LedgerEntry, LedgerService, Receipt};
pub use money::{Cents, Multiplier};
pub use notify::{EngineEvent, NotificationBus};
pub use payments::{
    ConfirmedPayment, PaymentIntent, PaymentProcessor, PaymentStatus, ProcessorError,
    SandboxProcessor, TopUpService,
};
pub use risk::{FixedDraw, StepContext, StepOutcome, entropy_source, seeded_source};
pub use session::{
    CashoutResult, GameSession, MoveResult, SessionId, SessionManager, SessionStart, SessionStatus,
    UnrefundedStake,
};

/// Wires the ledger, session manager, and top-up service around shared
/// collaborators.
#[derive(Debug)]
pub struct CrossableEngine {
    ledger: Arc<LedgerService>,
    sessions: SessionManager,
    top_ups: TopUpService,
}

impl CrossableEngine {
    /// Build an engine from validated configuration and injected collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if `rules` fails validation.
    pub fn new<R>(
        catalog: DifficultyCatalog,
        rules: RulesConfig,
        journal: Arc<dyn Journal>,
        processor: Arc<dyn PaymentProcessor>,
        rng: R,
    ) -> Result<Self, ConfigError>
    where
        R: RngCore + Send + 'static,
    {
        rules.validate()?;
        let ledger = Arc::new(LedgerService::new(journal.clone(), NotificationBus::new()));
        let top_ups = TopUpService::new(processor, ledger.clone(), rules.min_top_up_cents);
        let sessions = SessionManager::new(Arc::new(catalog), rules, ledger.clone(), journal, rng);
        Ok(Self {
            ledger,
            sessions,
            top_ups,
        })
    }

    /// Standard catalog, default rules, in-memory journal and sandbox payments.
    #[must_use]
    pub fn in_memory<R>(rng: R) -> Self
    where
        R: RngCore + Send + 'static,
    {
        let rules = RulesConfig::default();
        let journal: Arc<dyn Journal> = Arc::new(MemoryJournal::new());
        let ledger = Arc::new(LedgerService::new(journal.clone(), NotificationBus::new()));
        let top_ups = TopUpService::new(
            Arc::new(SandboxProcessor::new()),
            ledger.clone(),
            rules.min_top_up_cents,
        );
        let sessions = SessionManager::new(
            Arc::new(standard_catalog().clone()),
            rules,
            ledger.clone(),
            journal,
            rng,
        );
        Self {
            ledger,
            sessions,
            top_ups,
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &LedgerService {
        &self.ledger
    }

    #[must_use]
    pub const fn sessions(&self) -> &SessionManager {
        &self.sessions
    }

    #[must_use]
    pub const fn top_ups(&self) -> &TopUpService {
        &self.top_ups
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.ledger.bus().subscribe()
    }

    /// # Errors
    ///
    /// See [`LedgerService::open_account`].
    pub fn open_account(&self, user_id: &str, initial_balance: Cents) -> EngineResult<Account> {
        self.ledger.open_account(user_id, initial_balance)
    }

    /// # Errors
    ///
    /// See [`SessionManager::start`].
    pub fn start(
        &self,
        user_id: &str,
        bet_amount: Cents,
        difficulty: &str,
    ) -> EngineResult<SessionStart> {
        self.sessions.start(user_id, bet_amount, difficulty)
    }

    /// # Errors
    ///
    /// See [`SessionManager::r#move`].
    pub fn r#move(&self, session_id: SessionId, user_id: &str) -> EngineResult<MoveResult> {
        self.sessions.r#move(session_id, user_id)
    }

    /// # Errors
    ///
    /// See [`SessionManager::cashout`].
    pub fn cashout(&self, session_id: SessionId, user_id: &str) -> EngineResult<CashoutResult> {
        self.sessions.cashout(session_id, user_id)
    }

    /// # Errors
    ///
    /// See [`LedgerService::balance`].
    pub fn balance(&self, user_id: &str) -> EngineResult<Cents> {
        self.ledger.balance(user_id)
    }
}

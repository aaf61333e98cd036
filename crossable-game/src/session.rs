//! Game session lifecycle: start, step, and settlement.
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, TryLockError};
use uuid::Uuid;

use crate::config::{DifficultyCatalog, DifficultyProfile, RulesConfig};
use crate::constants::{KEY_CASHOUT, KEY_REFUND, LOG_SESSION};
use crate::error::{EngineError, EngineResult};
use crate::journal::Journal;
use crate::ledger::{EntryKind, LedgerService, Posting, idempotency_key};
use crate::money::{Cents, Multiplier};
use crate::notify::{EngineEvent, NotificationBus};
use crate::risk::{self, StepContext, StepOutcome};

pub type SessionId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Collided,
    CashedOut,
}

impl SessionStatus {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Active)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Active => "active",
            Self::Collided => "collided",
            Self::CashedOut => "cashed_out",
        };
        f.write_str(label)
    }
}

/// One wager from stake to settlement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GameSession {
    pub id: SessionId,
    pub user_id: String,
    pub bet_amount: Cents,
    pub difficulty: String,
    pub current_multiplier: Multiplier,
    pub previous_multiplier: Multiplier,
    pub steps_completed: u32,
    pub status: SessionStatus,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

impl GameSession {
    #[must_use]
    pub const fn is_active(&self) -> bool {
        matches!(self.status, SessionStatus::Active)
    }

    /// Amount a cashout would credit right now.
    #[must_use]
    pub fn potential_winnings(&self) -> Cents {
        self.current_multiplier.apply(self.bet_amount)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStart {
    pub session_id: SessionId,
    pub current_multiplier: Multiplier,
    pub balance: Cents,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MoveResult {
    pub collided: bool,
    pub current_multiplier: Multiplier,
    pub previous_multiplier: Multiplier,
    pub steps_completed: u32,
    pub status: SessionStatus,
    /// Present when this move reached the step cap and was settled.
    pub settlement: Option<CashoutResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashoutResult {
    pub session_id: SessionId,
    pub winnings: Cents,
    pub new_balance: Cents,
    pub final_multiplier: Multiplier,
}

/// Session state plus an evaluated step that has not been persisted yet.
/// The pending outcome is reused on retry so a step is never drawn twice.
#[derive(Debug)]
struct SessionCell {
    session: GameSession,
    pending: Option<StepOutcome>,
    /// Balance after the cashout credit, once it was applied. From here on the
    /// session can only finish settling.
    credited: Option<Cents>,
}

/// A stake whose compensating credit could not be applied yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnrefundedStake {
    pub session_id: SessionId,
    pub amount: Cents,
}

type SessionHandle = Arc<Mutex<SessionCell>>;

/// Sequences risk evaluation and ledger calls for every session.
pub struct SessionManager {
    catalog: Arc<DifficultyCatalog>,
    rules: RulesConfig,
    ledger: Arc<LedgerService>,
    journal: Arc<dyn Journal>,
    bus: NotificationBus,
    rng: Mutex<Box<dyn RngCore + Send>>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
    active_by_user: Mutex<HashMap<String, SessionId>>,
    unrefunded: Mutex<HashMap<String, Vec<UnrefundedStake>>>,
}

impl fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionManager")
            .field("rules", &self.rules)
            .field("difficulties", &self.catalog.names())
            .finish_non_exhaustive()
    }
}

impl SessionManager {
    #[must_use]
    pub fn new<R>(
        catalog: Arc<DifficultyCatalog>,
        rules: RulesConfig,
        ledger: Arc<LedgerService>,
        journal: Arc<dyn Journal>,
        rng: R,
    ) -> Self
    where
        R: RngCore + Send + 'static,
    {
        let bus = ledger.bus().clone();
        Self {
            catalog,
            rules,
            ledger,
            journal,
            bus,
            rng: Mutex::new(Box::new(rng)),
            sessions: RwLock::new(HashMap::new()),
            active_by_user: Mutex::new(HashMap::new()),
            unrefunded: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn rules(&self) -> &RulesConfig {
        &self.rules
    }

    #[must_use]
    pub fn catalog(&self) -> &DifficultyCatalog {
        &self.catalog
    }

    /// Debit the bet and open an Active session.
    ///
    /// # Errors
    ///
    /// `Validation`, `InvalidDifficulty`, `ConflictActiveSession`,
    /// `InsufficientFunds`, `NotFound`, or `Transient` when the journal is
    /// unavailable. No session exists and no money moves on failure. Stakes
    /// left over from earlier failed starts are refunded before the new debit.
    pub fn start(
        &self,
        user_id: &str,
        bet_amount: Cents,
        difficulty: &str,
    ) -> EngineResult<SessionStart> {
        if bet_amount <= 0 {
            return Err(EngineError::Validation(format!(
                "bet amount must be positive (got {bet_amount})"
            )));
        }
        let profile = self
            .catalog
            .get(difficulty)
            .ok_or_else(|| EngineError::InvalidDifficulty(difficulty.to_string()))?;
        // Fails with NotFound before anything is reserved.
        self.ledger.balance(user_id)?;
        self.retry_refunds(user_id)?;

        let session_id = Uuid::new_v4();
        self.reserve_active(user_id, session_id)?;
        match self.open_session(user_id, bet_amount, profile, session_id) {
            Ok(start) => Ok(start),
            Err(err) => {
                self.release_active(user_id, session_id);
                Err(err)
            }
        }
    }

    fn open_session(
        &self,
        user_id: &str,
        bet_amount: Cents,
        profile: &DifficultyProfile,
        session_id: SessionId,
    ) -> EngineResult<SessionStart> {
        let reference = session_id.to_string();
        let receipt = self.ledger.debit(user_id, bet_amount, &reference)?;

        let starting = profile.starting();
        let session = GameSession {
            id: session_id,
            user_id: user_id.to_string(),
            bet_amount,
            difficulty: profile.name.clone(),
            current_multiplier: starting,
            previous_multiplier: starting,
            steps_completed: 0,
            status: SessionStatus::Active,
            created_at: Utc::now(),
            ended_at: None,
        };
        if let Err(err) = self.journal.save_session(&session) {
            log::warn!(
                target: LOG_SESSION,
                "could not persist session {session_id}, refunding stake: {err}"
            );
            self.refund_stake(
                user_id,
                UnrefundedStake {
                    session_id,
                    amount: bet_amount,
                },
            )?;
            return Err(err.into());
        }

        self.sessions
            .write()
            .map_err(|_| EngineError::lock_poisoned("sessions"))?
            .insert(
                session_id,
                Arc::new(Mutex::new(SessionCell {
                    session,
                    pending: None,
                    credited: None,
                })),
            );
        log::info!(
            target: LOG_SESSION,
            "session {session_id} started for {user_id}: bet {bet_amount} on {} at {starting}",
            profile.name
        );
        Ok(SessionStart {
            session_id,
            current_multiplier: starting,
            balance: receipt.balance_after,
        })
    }

    /// Credit the stake back, or park it for [`Self::retry_refunds`].
    fn refund_stake(&self, user_id: &str, stake: UnrefundedStake) -> EngineResult<()> {
        if let Err(err) = self.post_refund(user_id, &stake) {
            log::error!(
                target: LOG_SESSION,
                "stake refund for session {} failed, keeping it pending: {err}",
                stake.session_id
            );
            self.unrefunded
                .lock()
                .map_err(|_| EngineError::lock_poisoned("unrefunded stakes"))?
                .entry(user_id.to_string())
                .or_default()
                .push(stake);
        }
        Ok(())
    }

    fn post_refund(&self, user_id: &str, stake: &UnrefundedStake) -> EngineResult<()> {
        let reference = stake.session_id.to_string();
        self.ledger.post(Posting {
            user_id,
            amount: stake.amount,
            kind: EntryKind::Credit,
            reference_id: &reference,
            idempotency_key: idempotency_key(KEY_REFUND, &reference),
        })?;
        Ok(())
    }

    /// Apply every stake refund still owed to `user_id`.
    ///
    /// Returns the total credited by this call.
    ///
    /// # Errors
    ///
    /// `Transient` if a refund still cannot be applied. It stays pending.
    pub fn retry_refunds(&self, user_id: &str) -> EngineResult<Cents> {
        let mut unrefunded = self
            .unrefunded
            .lock()
            .map_err(|_| EngineError::lock_poisoned("unrefunded stakes"))?;
        let Some(stakes) = unrefunded.get_mut(user_id) else {
            return Ok(0);
        };
        let mut refunded = 0;
        while let Some(stake) = stakes.first() {
            self.post_refund(user_id, stake)?;
            log::info!(
                target: LOG_SESSION,
                "refunded stake {} of session {} to {user_id}",
                stake.amount,
                stake.session_id
            );
            refunded += stake.amount;
            stakes.remove(0);
        }
        unrefunded.remove(user_id);
        Ok(refunded)
    }

    /// Stake refunds that failed and have not been applied since.
    ///
    /// # Errors
    ///
    /// `Transient` if the pending list is unavailable.
    pub fn unrefunded_stakes(&self, user_id: &str) -> EngineResult<Vec<UnrefundedStake>> {
        Ok(self
            .unrefunded
            .lock()
            .map_err(|_| EngineError::lock_poisoned("unrefunded stakes"))?
            .get(user_id)
            .cloned()
            .unwrap_or_default())
    }

    /// Take one step forward.
    ///
    /// Reaching the step cap settles the session through the same path as
    /// [`Self::cashout`]. A session that is still Active after its settlement
    /// failed part way (capped, or already credited) is settled again without
    /// a new draw.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown or foreign session, `NotActive` once the
    /// session ended, `Conflict` while another call holds the session, and
    /// `Transient` when the step could not be persisted.
    pub fn r#move(&self, session_id: SessionId, user_id: &str) -> EngineResult<MoveResult> {
        let handle = self.handle(session_id)?;
        let mut cell = lock_exclusive(&handle, session_id)?;
        ensure_playable(&cell.session, user_id)?;

        if cell.credited.is_some() || cell.session.steps_completed >= self.rules.step_cap {
            let settlement = self.settle(&mut cell)?;
            return Ok(move_result(&cell.session, false, Some(settlement)));
        }

        let outcome = match cell.pending {
            Some(outcome) => {
                log::debug!(
                    target: LOG_SESSION,
                    "reusing unpersisted step outcome for session {session_id}"
                );
                outcome
            }
            None => self.draw(&cell.session)?,
        };

        let mut next = cell.session.clone();
        if outcome.collided {
            next.status = SessionStatus::Collided;
            next.ended_at = Some(Utc::now());
        } else {
            next.previous_multiplier = next.current_multiplier;
            next.steps_completed += 1;
            next.current_multiplier = next
                .current_multiplier
                .saturating_add(outcome.multiplier_delta);
        }
        if let Err(err) = self.journal.save_session(&next) {
            log::warn!(
                target: LOG_SESSION,
                "step for session {session_id} not persisted: {err}"
            );
            cell.pending = Some(outcome);
            return Err(err.into());
        }
        cell.session = next;
        cell.pending = None;

        if outcome.collided {
            log::info!(
                target: LOG_SESSION,
                "session {session_id} collided on step {}, stake {} forfeited",
                cell.session.steps_completed + 1,
                cell.session.bet_amount
            );
            self.finish(&cell.session);
            return Ok(move_result(&cell.session, true, None));
        }

        log::debug!(
            target: LOG_SESSION,
            "session {session_id} cleared step {} -> {}",
            cell.session.steps_completed,
            cell.session.current_multiplier
        );
        let settlement = if cell.session.steps_completed >= self.rules.step_cap {
            match self.settle(&mut cell) {
                Ok(result) => Some(result),
                Err(err) if err.is_retryable() => {
                    log::warn!(
                        target: LOG_SESSION,
                        "automatic settlement of session {session_id} deferred: {err}"
                    );
                    None
                }
                Err(err) => return Err(err),
            }
        } else {
            None
        };
        Ok(move_result(&cell.session, false, settlement))
    }

    /// Settle an Active session at its current multiplier.
    ///
    /// # Errors
    ///
    /// Same as [`Self::r#move`]. A caller that timed out may retry: the
    /// credit is keyed by session so it applies once.
    pub fn cashout(&self, session_id: SessionId, user_id: &str) -> EngineResult<CashoutResult> {
        let handle = self.handle(session_id)?;
        let mut cell = lock_exclusive(&handle, session_id)?;
        ensure_playable(&cell.session, user_id)?;
        self.settle(&mut cell)
    }

    fn settle(&self, cell: &mut SessionCell) -> EngineResult<CashoutResult> {
        let winnings = cell.session.potential_winnings();
        let new_balance = match cell.credited {
            Some(balance) => balance,
            None => {
                let session = &cell.session;
                let reference = session.id.to_string();
                let balance = if winnings > 0 {
                    self.ledger
                        .post(Posting {
                            user_id: &session.user_id,
                            amount: winnings,
                            kind: EntryKind::Credit,
                            reference_id: &reference,
                            idempotency_key: idempotency_key(KEY_CASHOUT, &reference),
                        })?
                        .balance_after
                } else {
                    self.ledger.balance(&session.user_id)?
                };
                cell.credited = Some(balance);
                cell.pending = None;
                balance
            }
        };

        let mut next = cell.session.clone();
        next.status = SessionStatus::CashedOut;
        next.ended_at = Some(Utc::now());
        if let Err(err) = self.journal.save_session(&next) {
            log::warn!(
                target: LOG_SESSION,
                "session {} credited but not closed: {err}",
                next.id
            );
            return Err(err.into());
        }
        cell.session = next;

        log::info!(
            target: LOG_SESSION,
            "session {} cashed out at {} after {} steps: winnings {winnings}",
            cell.session.id,
            cell.session.current_multiplier,
            cell.session.steps_completed
        );
        self.finish(&cell.session);
        Ok(CashoutResult {
            session_id: cell.session.id,
            winnings,
            new_balance,
            final_multiplier: cell.session.current_multiplier,
        })
    }

    fn draw(&self, session: &GameSession) -> EngineResult<StepOutcome> {
        let profile = self
            .catalog
            .get(&session.difficulty)
            .ok_or_else(|| EngineError::InvalidDifficulty(session.difficulty.clone()))?;
        let ctx = StepContext {
            profile,
            rules: &self.rules,
            steps_completed: session.steps_completed,
        };
        let mut rng = self
            .rng
            .lock()
            .map_err(|_| EngineError::lock_poisoned("randomness source"))?;
        Ok(risk::evaluate(ctx, &mut **rng))
    }

    fn finish(&self, session: &GameSession) {
        self.release_active(&session.user_id, session.id);
        self.bus.publish(EngineEvent::SessionEnded {
            session_id: session.id,
            user_id: session.user_id.clone(),
            status: session.status,
        });
    }

    /// Snapshot of one session, active or closed.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown id.
    pub fn session(&self, session_id: SessionId) -> EngineResult<GameSession> {
        let handle = self.handle(session_id)?;
        let cell = handle
            .lock()
            .map_err(|_| EngineError::lock_poisoned("session"))?;
        Ok(cell.session.clone())
    }

    /// # Errors
    ///
    /// `Transient` if session state is unavailable.
    pub fn active_session(&self, user_id: &str) -> EngineResult<Option<GameSession>> {
        let active = self
            .active_by_user
            .lock()
            .map_err(|_| EngineError::lock_poisoned("active sessions"))?
            .get(user_id)
            .copied();
        match active {
            // A reservation without a stored session is a start in progress.
            Some(id) => match self.session(id) {
                Ok(session) => Ok(Some(session)),
                Err(EngineError::NotFound(_)) => Ok(None),
                Err(err) => Err(err),
            },
            None => Ok(None),
        }
    }

    /// Every session the user has played, newest first.
    ///
    /// # Errors
    ///
    /// `Transient` if session state is unavailable.
    pub fn sessions_for(&self, user_id: &str) -> EngineResult<Vec<GameSession>> {
        let handles: Vec<SessionHandle> = self
            .sessions
            .read()
            .map_err(|_| EngineError::lock_poisoned("sessions"))?
            .values()
            .cloned()
            .collect();
        let mut history = Vec::new();
        for handle in handles {
            let cell = handle
                .lock()
                .map_err(|_| EngineError::lock_poisoned("session"))?;
            if cell.session.user_id == user_id {
                history.push(cell.session.clone());
            }
        }
        history.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(history)
    }

    fn handle(&self, session_id: SessionId) -> EngineResult<SessionHandle> {
        self.sessions
            .read()
            .map_err(|_| EngineError::lock_poisoned("sessions"))?
            .get(&session_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("session {session_id}")))
    }

    fn reserve_active(&self, user_id: &str, session_id: SessionId) -> EngineResult<()> {
        let mut active = self
            .active_by_user
            .lock()
            .map_err(|_| EngineError::lock_poisoned("active sessions"))?;
        if let Some(existing) = active.get(user_id) {
            return Err(EngineError::ConflictActiveSession {
                user_id: user_id.to_string(),
                session_id: *existing,
            });
        }
        active.insert(user_id.to_string(), session_id);
        Ok(())
    }

    fn release_active(&self, user_id: &str, session_id: SessionId) {
        let mut active = self.active_by_user.lock().unwrap_or_else(|poisoned| {
            log::error!(
                target: LOG_SESSION,
                "active session index poisoned while releasing {session_id}"
            );
            poisoned.into_inner()
        });
        if active.get(user_id) == Some(&session_id) {
            active.remove(user_id);
        }
    }
}

fn lock_exclusive(
    handle: &SessionHandle,
    session_id: SessionId,
) -> EngineResult<std::sync::MutexGuard<'_, SessionCell>> {
    match handle.try_lock() {
        Ok(guard) => Ok(guard),
        Err(TryLockError::WouldBlock) => Err(EngineError::Conflict(format!(
            "session {session_id} is busy with another request"
        ))),
        Err(TryLockError::Poisoned(_)) => Err(EngineError::lock_poisoned("session")),
    }
}

fn ensure_playable(session: &GameSession, user_id: &str) -> EngineResult<()> {
    if session.user_id != user_id {
        return Err(EngineError::NotFound(format!("session {}", session.id)));
    }
    if session.status.is_terminal() {
        return Err(EngineError::NotActive {
            session_id: session.id,
            status: session.status,
        });
    }
    Ok(())
}

fn move_result(
    session: &GameSession,
    collided: bool,
    settlement: Option<CashoutResult>,
) -> MoveResult {
    MoveResult {
        collided,
        current_multiplier: session.current_multiplier,
        previous_multiplier: session.previous_multiplier,
        steps_completed: session.steps_completed,
        status: session.status,
        settlement,
    }
}

//! Authoritative balance store.
//!
//! Every account is guarded by its own mutex so that the balance-floor check,
//! journal write, and balance update for one user form a single unit, while
//! different users never contend. Idempotency keys are reserved in a shared
//! map before any work starts, so a key is applied at most once even when
//! two requests race on it.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

use crate::constants::{KEY_DEBIT, KEY_OPEN, KEY_WITHDRAW, LOG_LEDGER};
use crate::error::{EngineError, EngineResult};
use crate::journal::Journal;
use crate::money::Cents;
use crate::notify::{EngineEvent, NotificationBus};

/// Build a namespaced idempotency key.
#[must_use]
pub fn idempotency_key(prefix: &str, reference: impl std::fmt::Display) -> String {
    format!("{prefix}:{reference}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub user_id: String,
    pub balance: Cents,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    Debit,
    Credit,
}

impl EntryKind {
    /// Signed effect of `amount` on a balance.
    #[must_use]
    pub const fn signed(self, amount: Cents) -> Cents {
        match self {
            Self::Debit => -amount,
            Self::Credit => amount,
        }
    }
}

/// Immutable record of one applied balance mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: String,
    /// Always positive; direction comes from `kind`.
    pub amount: Cents,
    pub kind: EntryKind,
    pub reference_id: String,
    pub idempotency_key: String,
    pub balance_after: Cents,
    pub timestamp: DateTime<Utc>,
}

/// Acknowledgement returned for an applied (or replayed) mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Receipt {
    pub entry_id: Uuid,
    pub user_id: String,
    pub amount: Cents,
    pub kind: EntryKind,
    pub idempotency_key: String,
    pub balance_after: Cents,
    /// True when this call matched an already-applied key.
    #[serde(default)]
    pub replayed: bool,
}

impl Receipt {
    fn from_entry(entry: &LedgerEntry) -> Self {
        Self {
            entry_id: entry.id,
            user_id: entry.user_id.clone(),
            amount: entry.amount,
            kind: entry.kind,
            idempotency_key: entry.idempotency_key.clone(),
            balance_after: entry.balance_after,
            replayed: false,
        }
    }

    fn replay(&self) -> Self {
        Self {
            replayed: true,
            ..self.clone()
        }
    }
}

/// Result of reconciling an account against its entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditReport {
    pub user_id: String,
    pub balance: Cents,
    pub entry_sum: Cents,
    pub entry_count: usize,
}

impl AuditReport {
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.balance == self.entry_sum && self.balance >= 0
    }
}

/// A mutation request routed through [`LedgerService::post`].
#[derive(Debug, Clone)]
pub(crate) struct Posting<'a> {
    pub user_id: &'a str,
    pub amount: Cents,
    pub kind: EntryKind,
    pub reference_id: &'a str,
    pub idempotency_key: String,
}

#[derive(Debug)]
struct AccountBook {
    account: Account,
    entries: Vec<LedgerEntry>,
}

#[derive(Debug, Clone)]
enum KeyState {
    InFlight,
    Applied(Receipt),
}

pub struct LedgerService {
    accounts: RwLock<HashMap<String, Arc<Mutex<AccountBook>>>>,
    keys: Mutex<HashMap<String, KeyState>>,
    journal: Arc<dyn Journal>,
    bus: NotificationBus,
}

impl std::fmt::Debug for LedgerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerService").finish_non_exhaustive()
    }
}

impl LedgerService {
    #[must_use]
    pub fn new(journal: Arc<dyn Journal>, bus: NotificationBus) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            keys: Mutex::new(HashMap::new()),
            journal,
            bus,
        }
    }

    #[must_use]
    pub const fn bus(&self) -> &NotificationBus {
        &self.bus
    }

    /// Create an account, optionally funded with an opening credit.
    ///
    /// # Errors
    ///
    /// `Validation` for a blank user id or negative balance, `Conflict` if the
    /// account exists, `Transient` if the opening entry cannot be journaled.
    pub fn open_account(&self, user_id: &str, initial_balance: Cents) -> EngineResult<Account> {
        if user_id.trim().is_empty() {
            return Err(EngineError::Validation("user id must not be empty".into()));
        }
        if initial_balance < 0 {
            return Err(EngineError::Validation(format!(
                "opening balance must not be negative (got {initial_balance})"
            )));
        }
        // The opening key doubles as the per-user creation lock, so the
        // journal write happens without holding the accounts map.
        let key = idempotency_key(KEY_OPEN, user_id);
        {
            let mut keys = self
                .keys
                .lock()
                .map_err(|_| EngineError::lock_poisoned("idempotency keys"))?;
            if keys.contains_key(&key) {
                return Err(account_exists(user_id));
            }
            keys.insert(key.clone(), KeyState::InFlight);
        }
        let opened = self.create_book(user_id, initial_balance, &key);
        let receipt = opened.as_ref().ok().and_then(|(_, receipt)| receipt.as_ref());
        self.settle_key(&key, receipt);
        let (account, _) = opened?;

        log::info!(
            target: LOG_LEDGER,
            "opened account {user_id} with {initial_balance} cents"
        );
        self.bus.publish(EngineEvent::BalanceChanged {
            user_id: account.user_id.clone(),
            balance: account.balance,
        });
        Ok(account)
    }

    fn create_book(
        &self,
        user_id: &str,
        initial_balance: Cents,
        key: &str,
    ) -> EngineResult<(Account, Option<Receipt>)> {
        if self
            .accounts
            .read()
            .map_err(|_| EngineError::lock_poisoned("accounts"))?
            .contains_key(user_id)
        {
            return Err(account_exists(user_id));
        }

        let mut book = AccountBook {
            account: Account {
                user_id: user_id.to_string(),
                balance: 0,
            },
            entries: Vec::new(),
        };
        let mut receipt = None;
        if initial_balance > 0 {
            let entry = new_entry(
                user_id,
                initial_balance,
                EntryKind::Credit,
                user_id,
                key,
                initial_balance,
            );
            self.journal.append_entry(&entry)?;
            receipt = Some(Receipt::from_entry(&entry));
            book.account.balance = initial_balance;
            book.entries.push(entry);
        }
        let account = book.account.clone();
        self.accounts
            .write()
            .map_err(|_| EngineError::lock_poisoned("accounts"))?
            .insert(user_id.to_string(), Arc::new(Mutex::new(book)));
        Ok((account, receipt))
    }

    /// Atomically remove `amount` from the balance.
    ///
    /// A retried debit with the same `reference_id` returns the first receipt.
    ///
    /// # Errors
    ///
    /// `InsufficientFunds` if `amount` exceeds the balance, `NotFound` for an
    /// unknown account, `Validation` for a non-positive amount.
    pub fn debit(&self, user_id: &str, amount: Cents, reference_id: &str) -> EngineResult<Receipt> {
        self.post(Posting {
            user_id,
            amount,
            kind: EntryKind::Debit,
            reference_id,
            idempotency_key: idempotency_key(KEY_DEBIT, reference_id),
        })
    }

    /// Add `amount` exactly once per `idempotency_key`.
    ///
    /// # Errors
    ///
    /// `Conflict` when the key was already used for a different user, amount,
    /// or direction, or is being applied concurrently.
    pub fn credit(
        &self,
        user_id: &str,
        amount: Cents,
        idempotency_key: &str,
    ) -> EngineResult<Receipt> {
        self.post(Posting {
            user_id,
            amount,
            kind: EntryKind::Credit,
            reference_id: idempotency_key,
            idempotency_key: idempotency_key.to_string(),
        })
    }

    /// Pay funds out of the account to the player.
    ///
    /// # Errors
    ///
    /// Same as [`Self::debit`].
    pub fn withdraw(&self, user_id: &str, amount: Cents, request_id: &str) -> EngineResult<Receipt> {
        self.post(Posting {
            user_id,
            amount,
            kind: EntryKind::Debit,
            reference_id: request_id,
            idempotency_key: idempotency_key(KEY_WITHDRAW, request_id),
        })
    }

    /// # Errors
    ///
    /// `NotFound` for an unknown account.
    pub fn balance(&self, user_id: &str) -> EngineResult<Cents> {
        let book = self.book(user_id)?;
        let guard = book
            .lock()
            .map_err(|_| EngineError::lock_poisoned("account"))?;
        Ok(guard.account.balance)
    }

    /// Entries for one account, oldest first.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown account.
    pub fn entries(&self, user_id: &str) -> EngineResult<Vec<LedgerEntry>> {
        let book = self.book(user_id)?;
        let guard = book
            .lock()
            .map_err(|_| EngineError::lock_poisoned("account"))?;
        Ok(guard.entries.clone())
    }

    /// Recompute the balance from entries.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown account.
    pub fn audit(&self, user_id: &str) -> EngineResult<AuditReport> {
        let book = self.book(user_id)?;
        let guard = book
            .lock()
            .map_err(|_| EngineError::lock_poisoned("account"))?;
        let entry_sum = guard
            .entries
            .iter()
            .map(|entry| entry.kind.signed(entry.amount))
            .sum();
        Ok(AuditReport {
            user_id: user_id.to_string(),
            balance: guard.account.balance,
            entry_sum,
            entry_count: guard.entries.len(),
        })
    }

    /// Receipt previously recorded under `key`, if it was applied.
    ///
    /// # Errors
    ///
    /// `Transient` if the key index is unavailable.
    pub fn receipt_for(&self, key: &str) -> EngineResult<Option<Receipt>> {
        let keys = self
            .keys
            .lock()
            .map_err(|_| EngineError::lock_poisoned("idempotency keys"))?;
        Ok(match keys.get(key) {
            Some(KeyState::Applied(receipt)) => Some(receipt.clone()),
            _ => None,
        })
    }

    /// Every account id, sorted.
    ///
    /// # Errors
    ///
    /// `Transient` if the account map is unavailable.
    pub fn user_ids(&self) -> EngineResult<Vec<String>> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| EngineError::lock_poisoned("accounts"))?;
        let mut ids: Vec<String> = accounts.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }

    pub(crate) fn post(&self, posting: Posting<'_>) -> EngineResult<Receipt> {
        if posting.amount <= 0 {
            return Err(EngineError::Validation(format!(
                "amount must be positive (got {})",
                posting.amount
            )));
        }
        let book = self.book(posting.user_id)?;
        let mut guard = book
            .lock()
            .map_err(|_| EngineError::lock_poisoned("account"))?;

        if let Some(prior) = self.reserve_key(&posting)? {
            log::warn!(
                target: LOG_LEDGER,
                "replayed {} for {} ({} cents)",
                posting.idempotency_key,
                posting.user_id,
                posting.amount
            );
            return Ok(prior);
        }

        match self.apply_locked(&mut guard, &posting) {
            Ok(receipt) => {
                self.settle_key(&posting.idempotency_key, Some(&receipt));
                self.bus.publish(EngineEvent::BalanceChanged {
                    user_id: receipt.user_id.clone(),
                    balance: receipt.balance_after,
                });
                Ok(receipt)
            }
            Err(err) => {
                self.settle_key(&posting.idempotency_key, None);
                Err(err)
            }
        }
    }

    fn apply_locked(&self, book: &mut AccountBook, posting: &Posting<'_>) -> EngineResult<Receipt> {
        let balance = book.account.balance;
        let balance_after = match posting.kind {
            EntryKind::Debit => {
                if posting.amount > balance {
                    return Err(EngineError::InsufficientFunds {
                        requested: posting.amount,
                        available: balance,
                    });
                }
                balance - posting.amount
            }
            EntryKind::Credit => balance.checked_add(posting.amount).ok_or_else(|| {
                EngineError::Validation("credit would overflow the balance".into())
            })?,
        };
        let entry = new_entry(
            posting.user_id,
            posting.amount,
            posting.kind,
            posting.reference_id,
            &posting.idempotency_key,
            balance_after,
        );
        if let Err(err) = self.journal.append_entry(&entry) {
            log::warn!(
                target: LOG_LEDGER,
                "journal rejected {}: {err}",
                posting.idempotency_key
            );
            return Err(err.into());
        }
        book.account.balance = balance_after;
        let receipt = Receipt::from_entry(&entry);
        book.entries.push(entry);
        log::info!(
            target: LOG_LEDGER,
            "{:?} {} cents for {} ({}) -> balance {balance_after}",
            posting.kind,
            posting.amount,
            posting.user_id,
            posting.idempotency_key
        );
        Ok(receipt)
    }

    /// Returns the prior receipt for a replay, or reserves the key.
    fn reserve_key(&self, posting: &Posting<'_>) -> EngineResult<Option<Receipt>> {
        let mut keys = self
            .keys
            .lock()
            .map_err(|_| EngineError::lock_poisoned("idempotency keys"))?;
        match keys.get(&posting.idempotency_key) {
            Some(KeyState::Applied(prior)) => {
                if prior.user_id != posting.user_id
                    || prior.amount != posting.amount
                    || prior.kind != posting.kind
                {
                    return Err(EngineError::Conflict(format!(
                        "idempotency key {} was used for a different operation",
                        posting.idempotency_key
                    )));
                }
                Ok(Some(prior.replay()))
            }
            Some(KeyState::InFlight) => Err(EngineError::Conflict(format!(
                "operation {} is already in flight",
                posting.idempotency_key
            ))),
            None => {
                keys.insert(posting.idempotency_key.clone(), KeyState::InFlight);
                Ok(None)
            }
        }
    }

    /// Resolve a reservation. A poisoned index is still written so the key
    /// never stays in flight.
    fn settle_key(&self, key: &str, receipt: Option<&Receipt>) {
        let mut keys = self.keys.lock().unwrap_or_else(|poisoned| {
            log::error!(
                target: LOG_LEDGER,
                "idempotency key index poisoned while settling {key}"
            );
            poisoned.into_inner()
        });
        match receipt {
            Some(receipt) => {
                keys.insert(key.to_string(), KeyState::Applied(receipt.clone()));
            }
            None => {
                keys.remove(key);
            }
        }
    }

    fn book(&self, user_id: &str) -> EngineResult<Arc<Mutex<AccountBook>>> {
        let accounts = self
            .accounts
            .read()
            .map_err(|_| EngineError::lock_poisoned("accounts"))?;
        accounts
            .get(user_id)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("account {user_id}")))
    }
}

fn account_exists(user_id: &str) -> EngineError {
    EngineError::Conflict(format!("account {user_id} already exists"))
}

fn new_entry(
    user_id: &str,
    amount: Cents,
    kind: EntryKind,
    reference_id: &str,
    key: &str,
    balance_after: Cents,
) -> LedgerEntry {
    LedgerEntry {
        id: Uuid::new_v4(),
        user_id: user_id.to_string(),
        amount,
        kind,
        reference_id: reference_id.to_string(),
        idempotency_key: key.to_string(),
        balance_after,
        timestamp: Utc::now(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::MemoryJournal;

    fn ledger() -> (LedgerService, Arc<MemoryJournal>) {
        let journal = Arc::new(MemoryJournal::new());
        let ledger = LedgerService::new(journal.clone(), NotificationBus::new());
        (ledger, journal)
    }

    #[test]
    fn open_account_records_opening_credit() {
        let (ledger, journal) = ledger();
        let account = ledger.open_account("alice", 10_000).unwrap();
        assert_eq!(account.balance, 10_000);
        assert_eq!(journal.entries().len(), 1);
        assert!(matches!(
            ledger.open_account("alice", 0),
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(
            ledger.open_account("bob", -1),
            Err(EngineError::Validation(_))
        ));
    }

    /// Journal whose entry writes park until the test lets them through.
    struct GatedJournal {
        gate: std::sync::Barrier,
    }

    impl Journal for GatedJournal {
        fn append_entry(&self, _entry: &LedgerEntry) -> Result<(), crate::journal::JournalError> {
            self.gate.wait();
            self.gate.wait();
            Ok(())
        }

        fn save_session(
            &self,
            _session: &crate::session::GameSession,
        ) -> Result<(), crate::journal::JournalError> {
            Ok(())
        }
    }

    #[test]
    fn opening_journal_write_does_not_block_other_accounts() {
        let journal = Arc::new(GatedJournal {
            gate: std::sync::Barrier::new(2),
        });
        let ledger = LedgerService::new(journal.clone(), NotificationBus::new());
        ledger.open_account("alice", 0).unwrap();

        std::thread::scope(|s| {
            let opening = s.spawn(|| ledger.open_account("bob", 500));
            // bob's opening entry is now inside the journal.
            journal.gate.wait();
            assert_eq!(ledger.balance("alice").unwrap(), 0);
            assert!(ledger.open_account("carol", 0).is_ok());
            assert!(matches!(
                ledger.open_account("bob", 0),
                Err(EngineError::Conflict(_))
            ));
            assert!(matches!(
                ledger.balance("bob"),
                Err(EngineError::NotFound(_))
            ));
            journal.gate.wait();
            assert_eq!(opening.join().unwrap().unwrap().balance, 500);
        });
        assert_eq!(ledger.balance("bob").unwrap(), 500);
        assert_eq!(ledger.user_ids().unwrap(), vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn failed_opening_entry_leaves_no_account() {
        let (ledger, journal) = ledger();
        journal.fail_next(1);
        assert!(ledger.open_account("alice", 1_000).unwrap_err().is_retryable());
        assert!(matches!(
            ledger.balance("alice"),
            Err(EngineError::NotFound(_))
        ));
        assert_eq!(ledger.open_account("alice", 1_000).unwrap().balance, 1_000);
    }

    #[test]
    fn poisoned_key_index_still_releases_reservation() {
        let (ledger, _) = ledger();
        ledger
            .keys
            .lock()
            .unwrap()
            .insert("payment:pi_9".to_string(), KeyState::InFlight);
        let poisoner = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = ledger.keys.lock().unwrap();
                panic!("key index poisoned");
            })
            .join()
        });
        assert!(poisoner.is_err());

        ledger.settle_key("payment:pi_9", None);
        let keys = ledger
            .keys
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        assert!(!keys.contains_key("payment:pi_9"));
    }

    #[test]
    fn poisoned_account_map_is_reported() {
        let (ledger, _) = ledger();
        let poisoner = std::thread::scope(|s| {
            s.spawn(|| {
                let _guard = ledger.accounts.write().unwrap();
                panic!("account map poisoned");
            })
            .join()
        });
        assert!(poisoner.is_err());
        assert!(ledger.user_ids().unwrap_err().is_retryable());
    }

    #[test]
    fn debit_rejects_overdraft_without_mutation() {
        let (ledger, _) = ledger();
        ledger.open_account("alice", 500).unwrap();
        let err = ledger.debit("alice", 501, "s1").unwrap_err();
        assert_eq!(
            err,
            EngineError::InsufficientFunds {
                requested: 501,
                available: 500
            }
        );
        assert_eq!(ledger.balance("alice").unwrap(), 500);
        assert_eq!(ledger.entries("alice").unwrap().len(), 1);

        let receipt = ledger.debit("alice", 500, "s1").unwrap();
        assert_eq!(receipt.balance_after, 0);
        assert_eq!(ledger.balance("alice").unwrap(), 0);
    }

    #[test]
    fn credit_replay_returns_original_receipt() {
        let (ledger, journal) = ledger();
        ledger.open_account("alice", 0).unwrap();
        let first = ledger.credit("alice", 1_620, "cashout:abc").unwrap();
        let second = ledger.credit("alice", 1_620, "cashout:abc").unwrap();
        assert!(!first.replayed);
        assert!(second.replayed);
        assert_eq!(first.entry_id, second.entry_id);
        assert_eq!(ledger.balance("alice").unwrap(), 1_620);
        assert_eq!(journal.entries().len(), 1);
    }

    #[test]
    fn credit_replay_with_different_amount_conflicts() {
        let (ledger, _) = ledger();
        ledger.open_account("alice", 0).unwrap();
        ledger.open_account("bob", 0).unwrap();
        ledger.credit("alice", 100, "payment:pi_1").unwrap();
        assert!(matches!(
            ledger.credit("alice", 200, "payment:pi_1"),
            Err(EngineError::Conflict(_))
        ));
        assert!(matches!(
            ledger.credit("bob", 100, "payment:pi_1"),
            Err(EngineError::Conflict(_))
        ));
        assert_eq!(ledger.balance("bob").unwrap(), 0);
    }

    #[test]
    fn journal_failure_leaves_balance_untouched_and_key_free() {
        let (ledger, journal) = ledger();
        ledger.open_account("alice", 1_000).unwrap();
        journal.fail_next(1);
        let err = ledger.credit("alice", 250, "payment:pi_2").unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(ledger.balance("alice").unwrap(), 1_000);
        assert!(ledger.receipt_for("payment:pi_2").unwrap().is_none());

        let receipt = ledger.credit("alice", 250, "payment:pi_2").unwrap();
        assert!(!receipt.replayed);
        assert_eq!(ledger.balance("alice").unwrap(), 1_250);
        assert!(ledger.audit("alice").unwrap().is_consistent());
    }

    #[test]
    fn withdraw_is_idempotent_per_request() {
        let (ledger, _) = ledger();
        ledger.open_account("alice", 2_000).unwrap();
        ledger.withdraw("alice", 700, "w-1").unwrap();
        let replay = ledger.withdraw("alice", 700, "w-1").unwrap();
        assert!(replay.replayed);
        assert_eq!(ledger.balance("alice").unwrap(), 1_300);
    }

    #[test]
    fn unknown_account_and_bad_amounts_are_rejected() {
        let (ledger, _) = ledger();
        assert!(matches!(
            ledger.credit("ghost", 1, "k"),
            Err(EngineError::NotFound(_))
        ));
        ledger.open_account("alice", 0).unwrap();
        assert!(matches!(
            ledger.debit("alice", 0, "r"),
            Err(EngineError::Validation(_))
        ));
    }

    #[test]
    fn balance_changes_are_published() {
        let (ledger, _) = ledger();
        let mut rx = ledger.bus().subscribe();
        ledger.open_account("alice", 300).unwrap();
        ledger.debit("alice", 100, "s").unwrap();
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::BalanceChanged { balance: 300, .. })
        ));
        assert!(matches!(
            rx.try_recv(),
            Ok(EngineEvent::BalanceChanged { balance: 200, .. })
        ));
    }

    #[test]
    fn audit_matches_entry_sum() {
        let (ledger, _) = ledger();
        ledger.open_account("alice", 10_000).unwrap();
        ledger.debit("alice", 1_000, "s1").unwrap();
        ledger.credit("alice", 1_620, "cashout:s1").unwrap();
        ledger.withdraw("alice", 620, "w1").unwrap();
        let report = ledger.audit("alice").unwrap();
        assert_eq!(report.balance, 10_000);
        assert_eq!(report.entry_sum, 10_000);
        assert_eq!(report.entry_count, 4);
        assert!(report.is_consistent());
    }
}

//! Durable sinks that accept mutations before they are acknowledged.
use std::collections::VecDeque;
use std::sync::Mutex;
use thiserror::Error;

use crate::error::EngineError;
use crate::ledger::LedgerEntry;
use crate::session::GameSession;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JournalError {
    #[error("journal unavailable: {0}")]
    Unavailable(String),
}

impl From<JournalError> for EngineError {
    fn from(err: JournalError) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Storage collaborator for ledger entries and session snapshots.
/// Implementations must not return until the write is durable.
pub trait Journal: Send + Sync {
    /// Persist an accepted ledger entry.
    ///
    /// # Errors
    ///
    /// Returns an error if the entry could not be made durable.
    fn append_entry(&self, entry: &LedgerEntry) -> Result<(), JournalError>;

    /// Persist the latest snapshot of a session.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot could not be made durable.
    fn save_session(&self, session: &GameSession) -> Result<(), JournalError>;
}

/// In-process journal keeping everything in memory.
#[derive(Debug, Default)]
pub struct MemoryJournal {
    inner: Mutex<MemoryJournalState>,
}

#[derive(Debug, Default)]
struct MemoryJournalState {
    entries: Vec<LedgerEntry>,
    sessions: Vec<GameSession>,
    /// Queue of upcoming writes that should fail, consumed front to back.
    scripted_failures: VecDeque<bool>,
}

impl MemoryJournal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` writes fail as if the backend were unreachable.
    pub fn fail_next(&self, count: usize) {
        if let Ok(mut state) = self.inner.lock() {
            state.scripted_failures.extend(std::iter::repeat_n(true, count));
        }
    }

    /// Let `skip` writes through, then fail the one after.
    pub fn fail_after(&self, skip: usize) {
        if let Ok(mut state) = self.inner.lock() {
            state.scripted_failures.extend(std::iter::repeat_n(false, skip));
            state.scripted_failures.push_back(true);
        }
    }

    #[must_use]
    pub fn entries(&self) -> Vec<LedgerEntry> {
        self.inner
            .lock()
            .map(|state| state.entries.clone())
            .unwrap_or_default()
    }

    /// Every snapshot written, oldest first.
    #[must_use]
    pub fn session_snapshots(&self) -> Vec<GameSession> {
        self.inner
            .lock()
            .map(|state| state.sessions.clone())
            .unwrap_or_default()
    }

    fn write<T>(&self, record: impl FnOnce(&mut MemoryJournalState) -> T) -> Result<T, JournalError> {
        let mut state = self
            .inner
            .lock()
            .map_err(|_| JournalError::Unavailable("memory journal poisoned".to_string()))?;
        if state.scripted_failures.pop_front().unwrap_or(false) {
            return Err(JournalError::Unavailable("scripted outage".to_string()));
        }
        Ok(record(&mut state))
    }
}

impl Journal for MemoryJournal {
    fn append_entry(&self, entry: &LedgerEntry) -> Result<(), JournalError> {
        self.write(|state| state.entries.push(entry.clone()))
    }

    fn save_session(&self, session: &GameSession) -> Result<(), JournalError> {
        self.write(|state| state.sessions.push(session.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::EntryKind;
    use chrono::Utc;
    use uuid::Uuid;

    fn entry() -> LedgerEntry {
        LedgerEntry {
            id: Uuid::new_v4(),
            user_id: "u1".to_string(),
            amount: 100,
            kind: EntryKind::Credit,
            reference_id: "ref".to_string(),
            idempotency_key: "credit:ref".to_string(),
            balance_after: 100,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn scripted_failures_are_consumed_in_order() {
        let journal = MemoryJournal::new();
        journal.fail_after(1);
        assert!(journal.append_entry(&entry()).is_ok());
        assert!(journal.append_entry(&entry()).is_err());
        assert!(journal.append_entry(&entry()).is_ok());
        assert_eq!(journal.entries().len(), 2);
    }

    #[test]
    fn journal_errors_are_transient() {
        let err: EngineError = JournalError::Unavailable("down".into()).into();
        assert!(err.is_retryable());
    }
}

//! Engine error taxonomy.
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::money::Cents;
use crate::session::SessionStatus;

/// Broad classification used by callers to decide whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Validation,
    Conflict,
    InsufficientFunds,
    NotFound,
    NotActive,
    Transient,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("invalid request: {0}")]
    Validation(String),
    #[error("unknown difficulty '{0}'")]
    InvalidDifficulty(String),
    #[error("user {user_id} already has active session {session_id}")]
    ConflictActiveSession { user_id: String, session_id: Uuid },
    #[error("conflicting operation: {0}")]
    Conflict(String),
    #[error("insufficient funds: requested {requested} cents, available {available} cents")]
    InsufficientFunds { requested: Cents, available: Cents },
    #[error("{0} not found")]
    NotFound(String),
    #[error("session {session_id} is not active ({status})")]
    NotActive {
        session_id: Uuid,
        status: SessionStatus,
    },
    #[error("backend unavailable: {0}")]
    Transient(String),
}

impl EngineError {
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::Validation(_) | Self::InvalidDifficulty(_) => ErrorClass::Validation,
            Self::ConflictActiveSession { .. } | Self::Conflict(_) => ErrorClass::Conflict,
            Self::InsufficientFunds { .. } => ErrorClass::InsufficientFunds,
            Self::NotFound(_) => ErrorClass::NotFound,
            Self::NotActive { .. } => ErrorClass::NotActive,
            Self::Transient(_) => ErrorClass::Transient,
        }
    }

    /// Whether re-issuing the identical request may succeed.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self.class(), ErrorClass::Conflict | ErrorClass::Transient)
    }

    pub(crate) fn lock_poisoned(what: &str) -> Self {
        Self::Transient(format!("{what} lock poisoned"))
    }
}

pub type EngineResult<T> = Result<T, EngineError>;

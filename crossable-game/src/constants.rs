//! Centralized rule and tuning constants for the Mission Crossable engine.
//!
//! These values define the deterministic settlement math. Keeping them
//! together means payout rules can only move through reviewed code changes;
//! the difficulty table itself lives in [`crate::config`].

// Session rules ------------------------------------------------------------
/// Maximum number of steps before the session is settled automatically.
pub const STEP_CAP: u32 = 25;
/// Steps per set; completing a set scales that step's multiplier delta.
pub const SET_SIZE: u32 = 6;
/// Collision probability scale applied on set-completing steps.
pub const SET_BOUNDARY_RISK_FACTOR: f64 = 1.1;
/// Bonus applied to the multiplier delta of a set-completing step.
pub const DEFAULT_SET_BONUS_FACTOR: f64 = 1.2;

// Money ---------------------------------------------------------------------
/// Basis points per 1.00x multiplier.
pub const MULTIPLIER_SCALE: i64 = 10_000;
/// Cents per whole currency unit.
pub const CENTS_PER_UNIT: i64 = 100;
/// Smallest top-up accepted from the payment processor ($5.00).
pub const MIN_TOP_UP_CENTS: i64 = 500;

// Idempotency key prefixes ----------------------------------------------------
pub(crate) const KEY_OPEN: &str = "open";
pub(crate) const KEY_DEBIT: &str = "debit";
pub(crate) const KEY_CASHOUT: &str = "cashout";
pub(crate) const KEY_PAYMENT: &str = "payment";
pub(crate) const KEY_WITHDRAW: &str = "withdraw";
pub(crate) const KEY_REFUND: &str = "refund";

// Notifications -------------------------------------------------------------
pub(crate) const EVENT_CHANNEL_CAPACITY: usize = 256;

// Logging targets -------------------------------------------------------------
pub(crate) const LOG_LEDGER: &str = "crossable::ledger";
pub(crate) const LOG_SESSION: &str = "crossable::session";
pub(crate) const LOG_RISK: &str = "crossable::risk";
pub(crate) const LOG_PAYMENTS: &str = "crossable::payments";

#[cfg(test)]
pub(crate) const FLOAT_EPSILON: f64 = 1e-9;

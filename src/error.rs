//! Unified error types for the dispenser core.
//!
//! A single `Error` enum that every subsystem funnels into, so the service
//! facade and the orchestrator report failures uniformly. Every variant
//! carries enough context (which ingredient, which pump, what was attempted)
//! for an API layer to render a user-facing message.

use core::fmt;

use crate::registry::PumpId;

// ---------------------------------------------------------------------------
// Top-level error
// ---------------------------------------------------------------------------

/// Every fallible operation in the core returns this type.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// Invalid pump, recipe, flow-rate or configuration data.
    /// Always raised before any actuation starts.
    Config(String),
    /// No pump with this id is registered.
    PumpNotFound(PumpId),
    /// The ledger cannot satisfy a deduction.
    InsufficientStock {
        ingredient: String,
        requested_ml: f32,
        available_ml: f32,
    },
    /// Another job holds the rig.
    Busy { holder: String },
    /// Driver-reported hardware fault for one pump.
    Actuation { pump: PumpId, reason: String },
    /// Implausible measured flow rate.
    Calibration(String),
    /// The persistent store could not be reached. Non-fatal: the in-memory
    /// state stays authoritative until the store recovers.
    PersistenceUnavailable(String),
    /// A job control action arrived in a state that does not accept it.
    InvalidState {
        action: &'static str,
        state: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::PumpNotFound(id) => write!(f, "pump {id} not found"),
            Self::InsufficientStock {
                ingredient,
                requested_ml,
                available_ml,
            } => write!(
                f,
                "insufficient stock for '{ingredient}': requested {requested_ml:.1} ml, \
                 available {available_ml:.1} ml"
            ),
            Self::Busy { holder } => write!(f, "rig busy: {holder} in progress"),
            Self::Actuation { pump, reason } => write!(f, "pump {pump} actuation failed: {reason}"),
            Self::Calibration(msg) => write!(f, "calibration: {msg}"),
            Self::PersistenceUnavailable(msg) => write!(f, "persistence unavailable: {msg}"),
            Self::InvalidState { action, state } => {
                write!(f, "cannot {action} while job is {state}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl Error {
    /// Shorthand for building a [`Error::Config`].
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// True for errors that leave the system state untouched and are
    /// reported straight back to the caller.
    pub fn is_rejection(&self) -> bool {
        matches!(self, Self::Config(_) | Self::Busy { .. } | Self::PumpNotFound(_))
    }
}

// ---------------------------------------------------------------------------
// Convenience Result alias
// ---------------------------------------------------------------------------

/// Crate-wide `Result` alias.
pub type Result<T> = core::result::Result<T, Error>;

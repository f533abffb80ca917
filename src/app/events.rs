//! Outbound application events.
//!
//! The orchestrator and calibration service emit these through the
//! [`EventSink`](super::ports::EventSink) port. Adapters on the other side
//! decide what to do with them: log them, push them to a progress screen,
//! record them for statistics.

use crate::dispense::state::JobState;
use crate::gate::RigOperation;
use crate::registry::PumpId;

/// Structured events emitted by the core.
#[derive(Debug, Clone, PartialEq)]
pub enum DispenseEvent {
    /// The job moved between states.
    JobStateChanged { from: JobState, to: JobState },

    /// A pump was switched on.
    ActuationStarted {
        pump: PumpId,
        ingredient: String,
        volume_ml: f32,
        duration_ms: u32,
    },

    /// A pump finished and its volume was committed to the ledger.
    ActuationCommitted {
        pump: PumpId,
        ingredient: String,
        dispensed_ml: f32,
        remaining_ml: f32,
    },

    /// A pump reported a hardware fault; nothing was deducted.
    ActuationFailed {
        pump: PumpId,
        ingredient: String,
        reason: String,
    },

    /// An actuation was skipped or not committed for lack of stock.
    StockExhausted {
        ingredient: String,
        requested_ml: f32,
        available_ml: f32,
    },

    /// The job is paused waiting for the operator.
    ManualStepPending {
        ingredient: String,
        instruction: Option<String>,
    },

    /// The operator acknowledged the pending manual step.
    ManualStepAcknowledged { ingredient: String },

    /// After a commit the ingredient fell below the low-stock threshold.
    StockLow {
        ingredient: String,
        remaining_ml: f32,
        capacity_ml: f32,
    },

    /// A maintenance run (calibrate, vent, clean) ended.
    MaintenanceFinished {
        operation: RigOperation,
        duration_ms: u32,
        ok: bool,
    },
}

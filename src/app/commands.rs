//! Inbound commands to the application service.
//!
//! These represent actions requested by the outside world (CLI, HTTP
//! layer, touch screen) that the [`AppService`](super::service::AppService)
//! interprets and acts upon, plus the matching responses.

use serde::Serialize;

use crate::availability::Availability;
use crate::calibration::CalibrationRun;
use crate::dispense::DispenseResult;
use crate::dispense::state::JobStatus;
use crate::ledger::IngredientLevel;
use crate::recipe::Recipe;
use crate::registry::{PumpConfig, PumpId};

/// Commands that external adapters can send into the application core.
#[derive(Debug, Clone)]
pub enum AppCommand {
    // ── Dispensing ──
    /// Pour a recipe at the given serving size.
    Dispense { recipe: Recipe, size_ml: f32 },
    /// Pour a single ingredient.
    Shot { ingredient: String, amount_ml: f32 },
    /// Check feasibility without pouring.
    Availability { recipe: Recipe, size_ml: f32 },
    /// Acknowledge the pending manual step of the running job.
    Resume,
    /// Cancel the running job.
    Abort,
    /// State of the running job.
    Status,

    // ── Ledger ──
    Refill { ingredient: String },
    RefillAll,
    SetCapacity { ingredient: String, capacity_ml: f32 },
    SetAmount { ingredient: String, amount_ml: f32 },
    Levels,
    /// Replace every level from a backup document.
    ImportLevels { json: String },

    // ── Pumps ──
    Pumps,
    ReplacePumps(Vec<PumpConfig>),
    SetFlowRate { pump: PumpId, ml_per_sec: f32 },
    SetEnabled { pump: PumpId, enabled: bool },

    // ── Maintenance ──
    /// Timed test run; answer with `CompleteCalibration` once measured.
    CalibrationTest { pump: PumpId, duration_ms: u32 },
    CompleteCalibration { run: CalibrationRun, measured_ml: f32 },
    Vent { pump: PumpId, duration_ms: Option<u32> },
    Clean { pump: PumpId, duration_ms: u32 },
}

/// Replies from [`AppService::handle_command`](super::service::AppService::handle_command).
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum AppResponse {
    Dispensed(DispenseResult),
    Availability(Availability),
    Status(Option<JobStatus>),
    Level(IngredientLevel),
    Levels(Vec<IngredientLevel>),
    Pumps(Vec<PumpConfig>),
    CalibrationRun(CalibrationRun),
    FlowRate { pump: PumpId, ml_per_sec: f32 },
    Ran { pump: PumpId, duration_ms: u32 },
    Ack,
}

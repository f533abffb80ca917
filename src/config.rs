//! System configuration parameters
//!
//! All tunable parameters for the dispenser core. Values are loaded from
//! `config.json` in the data directory when present, otherwise the
//! defaults below apply.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Core system configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DispenserConfig {
    // --- Scheduling ---
    /// Maximum number of pumps energised at the same time (power draw).
    pub max_concurrent_pumps: usize,
    /// Pause before each delayed phase (layered drinks), milliseconds.
    pub delayed_phase_settle_ms: u32,
    /// How often workers check the abort flag while a pump runs.
    pub abort_poll_ms: u32,

    // --- Actuation limits ---
    /// Shortest actuation the relays can time accurately.
    pub min_actuation_ms: u32,
    /// Hard watchdog cutoff for any single actuation.
    pub max_actuation_ms: u32,
    /// Vent duration for pumps without their own `ventDuration`.
    pub default_vent_ms: u32,

    // --- Stock ---
    /// Remaining-after-pour fraction of capacity below which an
    /// ingredient is reported as low (0.0-1.0).
    pub low_stock_fraction: f32,
    /// Capacity given to ingredients that have no ledger row yet.
    pub default_capacity_ml: f32,

    // --- Calibration ---
    /// Lowest plausible measured flow rate (ml/s).
    pub min_flow_rate: f32,
    /// Highest plausible measured flow rate (ml/s).
    pub max_flow_rate: f32,

    // --- Persistence ---
    /// Periodic flush interval for dirty state (seconds).
    pub autosave_interval_secs: u32,
    /// Upper bound on the final flush at shutdown.
    pub shutdown_flush_timeout_ms: u32,
}

impl Default for DispenserConfig {
    fn default() -> Self {
        Self {
            // Scheduling
            max_concurrent_pumps: 2,
            delayed_phase_settle_ms: 2000,
            abort_poll_ms: 5,

            // Actuation
            min_actuation_ms: 1,
            max_actuation_ms: 120_000, // 2 min
            default_vent_ms: 2000,

            // Stock
            low_stock_fraction: 0.15,
            default_capacity_ml: 1000.0,

            // Calibration
            min_flow_rate: 0.05,
            max_flow_rate: 50.0,

            // Persistence
            autosave_interval_secs: 30,
            shutdown_flush_timeout_ms: 2000,
        }
    }
}

impl DispenserConfig {
    /// Range-check every field. Invalid values are rejected, not clamped.
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent_pumps == 0 || self.max_concurrent_pumps > 16 {
            return Err(Error::config("maxConcurrentPumps must be 1-16"));
        }
        if !(0.0..1.0).contains(&self.low_stock_fraction) {
            return Err(Error::config("lowStockFraction must be in [0, 1)"));
        }
        if !(self.default_capacity_ml.is_finite() && self.default_capacity_ml > 0.0) {
            return Err(Error::config("defaultCapacityMl must be > 0"));
        }
        if self.min_actuation_ms == 0 {
            return Err(Error::config("minActuationMs must be >= 1"));
        }
        if self.max_actuation_ms <= self.min_actuation_ms {
            return Err(Error::config("maxActuationMs must exceed minActuationMs"));
        }
        if self.default_vent_ms == 0 || self.default_vent_ms > self.max_actuation_ms {
            return Err(Error::config("defaultVentMs must be 1..=maxActuationMs"));
        }
        if !(self.min_flow_rate > 0.0 && self.min_flow_rate < self.max_flow_rate) {
            return Err(Error::config("flow-rate bounds must satisfy 0 < min < max"));
        }
        if self.abort_poll_ms == 0 || self.abort_poll_ms > 1000 {
            return Err(Error::config("abortPollMs must be 1-1000"));
        }
        if self.autosave_interval_secs == 0 {
            return Err(Error::config("autosaveIntervalSecs must be >= 1"));
        }
        Ok(())
    }

    /// Parse and validate a JSON document.
    pub fn from_json(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)
            .map_err(|e| Error::config(format!("config.json: {e}")))?;
        cfg.validate()?;
        Ok(cfg)
    }
}

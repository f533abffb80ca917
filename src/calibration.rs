//! Calibration and maintenance runs.
//!
//! A calibration is a timed test run followed by the operator measuring
//! what came out:
//!
//! ```text
//!  run_test(pump, ms) ──▶ pump runs ms ──▶ CalibrationRun
//!                                              │ operator weighs glass
//!  complete(run, measured_ml) ──▶ flow = measured / (ms / 1000) ──▶ registry
//! ```
//!
//! Vent (priming the line) and clean (flushing with water) are plain timed
//! runs. None of these touch the ledger; all of them hold the rig gate,
//! and so does storing a calibrated flow rate.

use std::sync::Arc;

use futures_lite::future::block_on;
use log::{info, warn};
use serde::Serialize;

use crate::app::events::DispenseEvent;
use crate::app::ports::{ActuationOutcome, ActuatorPort, EventSink};
use crate::config::DispenserConfig;
use crate::error::{Error, Result};
use crate::gate::{RigGate, RigOperation};
use crate::registry::{PumpConfig, PumpId, PumpRegistry};

/// A finished test run awaiting its measured volume.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CalibrationRun {
    pub pump: PumpId,
    pub duration_ms: u32,
}

pub struct CalibrationService<A> {
    registry: Arc<PumpRegistry>,
    actuator: Arc<A>,
    sink: Arc<dyn EventSink + Send + Sync>,
    gate: Arc<RigGate>,
    cfg: DispenserConfig,
}

impl<A: ActuatorPort> CalibrationService<A> {
    pub fn new(
        registry: Arc<PumpRegistry>,
        actuator: Arc<A>,
        sink: Arc<dyn EventSink + Send + Sync>,
        gate: Arc<RigGate>,
        cfg: DispenserConfig,
    ) -> Self {
        Self {
            registry,
            actuator,
            sink,
            gate,
            cfg,
        }
    }

    /// Run `pump` for `duration_ms` so the operator can measure the output.
    pub fn run_test(&self, pump: PumpId, duration_ms: u32) -> Result<CalibrationRun> {
        self.timed_run(RigOperation::Calibrate(pump), pump, duration_ms)?;
        Ok(CalibrationRun { pump, duration_ms })
    }

    /// Derive and store the flow rate from the measured volume of `run`.
    pub fn complete(&self, run: CalibrationRun, measured_ml: f32) -> Result<f32> {
        if !(measured_ml.is_finite() && measured_ml > 0.0) {
            return Err(Error::Calibration(format!(
                "measured volume must be > 0 ml, got {measured_ml}"
            )));
        }
        let flow = measured_ml / (run.duration_ms as f32 / 1000.0);
        if !(self.cfg.min_flow_rate..=self.cfg.max_flow_rate).contains(&flow) {
            return Err(Error::Calibration(format!(
                "pump {}: {flow:.3} ml/s outside plausible range {}-{} ml/s",
                run.pump, self.cfg.min_flow_rate, self.cfg.max_flow_rate
            )));
        }
        let _gate = self.gate.try_acquire(RigOperation::Calibrate(run.pump))?;
        self.registry.set_flow_rate(run.pump, flow)?;
        info!(
            "Calibration: pump {} -> {:.3} ml/s ({:.1} ml in {} ms)",
            run.pump, flow, measured_ml, run.duration_ms
        );
        Ok(flow)
    }

    /// Test run plus measurement in one call. `measure` is asked for the
    /// volume once the pump has stopped.
    pub fn calibrate<F>(&self, pump: PumpId, duration_ms: u32, measure: F) -> Result<f32>
    where
        F: FnOnce(&CalibrationRun) -> Result<f32>,
    {
        let run = self.run_test(pump, duration_ms)?;
        let measured = measure(&run)?;
        self.complete(run, measured)
    }

    /// Prime the line. Uses the pump's own vent duration, then the
    /// configured default, unless `duration_ms` is given.
    pub fn vent(&self, pump: PumpId, duration_ms: Option<u32>) -> Result<u32> {
        let cfg = self.lookup(pump)?;
        let ms = duration_ms
            .or(cfg.vent_duration_ms)
            .unwrap_or(self.cfg.default_vent_ms);
        self.timed_run(RigOperation::Vent(pump), pump, ms)?;
        Ok(ms)
    }

    /// Flush the line (pump drawing from a water reservoir).
    pub fn clean(&self, pump: PumpId, duration_ms: u32) -> Result<()> {
        self.timed_run(RigOperation::Clean(pump), pump, duration_ms)
    }

    fn timed_run(&self, op: RigOperation, pump: PumpId, duration_ms: u32) -> Result<()> {
        if duration_ms == 0 || duration_ms > self.cfg.max_actuation_ms {
            return Err(Error::config(format!(
                "duration must be 1-{} ms, got {duration_ms}",
                self.cfg.max_actuation_ms
            )));
        }
        let cfg = self.lookup(pump)?;
        let _gate = self.gate.try_acquire(op)?;
        if !cfg.enabled {
            warn!("{}: pump {} is disabled, running anyway", op, pump);
        }

        info!("Starting {} for {} ms", op, duration_ms);
        let outcome = block_on(self.actuator.activate(&cfg, duration_ms));
        let ok = matches!(outcome, ActuationOutcome::Completed { .. });
        self.sink.emit(&DispenseEvent::MaintenanceFinished {
            operation: op,
            duration_ms,
            ok,
        });
        match outcome {
            ActuationOutcome::Completed { .. } => Ok(()),
            ActuationOutcome::Failed { reason } => {
                warn!("{} failed: {}", op, reason);
                Err(Error::Actuation {
                    pump,
                    reason: reason.to_string(),
                })
            }
        }
    }

    fn lookup(&self, pump: PumpId) -> Result<PumpConfig> {
        self.registry.pump(pump).ok_or(Error::PumpNotFound(pump))
    }
}

//! Application service: the hexagonal core.
//!
//! [`AppService`] owns the pump registry, the ingredient ledger, the
//! orchestrator and the calibration service, all sharing one rig gate.
//! All I/O flows through port traits injected at construction, making the
//! whole service testable with mock adapters.
//!
//! ```text
//!  StorePort ───▶ ┌──────────────────────────────┐ ──▶ EventSink
//!                 │          AppService          │
//! ActuatorPort ◀──│ Registry · Ledger · RigGate  │
//!                 │ Orchestrator · Calibration   │
//!                 └──────────────────────────────┘
//! ```

use std::sync::Arc;

use log::info;

use crate::adapters::json_store::parse_levels;
use crate::autosave::flush_dirty;
use crate::calibration::CalibrationService;
use crate::config::DispenserConfig;
use crate::dispense::Orchestrator;
use crate::error::Result;
use crate::gate::{RigGate, RigOperation};
use crate::ledger::IngredientLedger;
use crate::registry::PumpRegistry;

use super::commands::{AppCommand, AppResponse};
use super::ports::{ActuatorPort, EventSink, StorePort};

// ───────────────────────────────────────────────────────────────
// AppService
// ───────────────────────────────────────────────────────────────

pub struct AppService<A> {
    config: DispenserConfig,
    registry: Arc<PumpRegistry>,
    ledger: Arc<IngredientLedger>,
    orchestrator: Orchestrator<A>,
    calibration: CalibrationService<A>,
    gate: Arc<RigGate>,
}

impl<A: ActuatorPort> AppService<A> {
    /// Load state from `store` and wire the services together.
    ///
    /// An unreachable store is not fatal: the pump table falls back to the
    /// factory defaults and the ledger starts empty.
    pub fn new(
        config: DispenserConfig,
        store: Arc<dyn StorePort>,
        actuator: Arc<A>,
        sink: Arc<dyn EventSink + Send + Sync>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = Arc::new(PumpRegistry::load(store.clone())?);
        let ledger = Arc::new(IngredientLedger::load(config.default_capacity_ml, store));
        Ok(Self::from_parts(config, registry, ledger, actuator, sink))
    }

    /// Wire already-built registry and ledger.
    pub fn from_parts(
        config: DispenserConfig,
        registry: Arc<PumpRegistry>,
        ledger: Arc<IngredientLedger>,
        actuator: Arc<A>,
        sink: Arc<dyn EventSink + Send + Sync>,
    ) -> Self {
        let gate = Arc::new(RigGate::new());
        let orchestrator = Orchestrator::new(
            registry.clone(),
            ledger.clone(),
            actuator.clone(),
            sink.clone(),
            gate.clone(),
            config.clone(),
        );
        let calibration = CalibrationService::new(
            registry.clone(),
            actuator,
            sink,
            gate.clone(),
            config.clone(),
        );
        info!(
            "AppService ready: {} enabled pumps, max {} concurrent",
            registry.list_enabled().len(),
            config.max_concurrent_pumps
        );
        Self {
            config,
            registry,
            ledger,
            orchestrator,
            calibration,
            gate,
        }
    }

    // ── Command handling ──────────────────────────────────────

    /// Execute one command. Dispense and maintenance commands block until
    /// the rig is idle again.
    pub fn handle_command(&self, cmd: AppCommand) -> Result<AppResponse> {
        match cmd {
            AppCommand::Dispense { recipe, size_ml } => self
                .orchestrator
                .dispense(&recipe, size_ml)
                .map(AppResponse::Dispensed),
            AppCommand::Shot {
                ingredient,
                amount_ml,
            } => self
                .orchestrator
                .dispense_shot(&ingredient, amount_ml)
                .map(AppResponse::Dispensed),
            AppCommand::Availability { recipe, size_ml } => self
                .orchestrator
                .availability(&recipe, size_ml)
                .map(AppResponse::Availability),
            AppCommand::Resume => self.orchestrator.resume().map(|()| AppResponse::Ack),
            AppCommand::Abort => self.orchestrator.abort().map(|()| AppResponse::Ack),
            AppCommand::Status => Ok(AppResponse::Status(self.orchestrator.status())),

            AppCommand::Refill { ingredient } => {
                Ok(AppResponse::Level(self.ledger.refill(&ingredient)))
            }
            AppCommand::RefillAll => Ok(AppResponse::Levels(self.ledger.refill_all())),
            AppCommand::SetCapacity {
                ingredient,
                capacity_ml,
            } => self
                .ledger
                .set_capacity(&ingredient, capacity_ml)
                .map(AppResponse::Level),
            AppCommand::SetAmount {
                ingredient,
                amount_ml,
            } => self
                .ledger
                .set_amount(&ingredient, amount_ml)
                .map(AppResponse::Level),
            AppCommand::Levels => Ok(AppResponse::Levels(self.ledger.snapshot())),
            AppCommand::ImportLevels { json } => {
                let levels = parse_levels(&json)
                    .map_err(|e| crate::error::Error::config(format!("levels import: {e}")))?;
                self.ledger.replace_all(levels)?;
                Ok(AppResponse::Levels(self.ledger.snapshot()))
            }

            AppCommand::Pumps => Ok(AppResponse::Pumps(self.registry.list_all())),
            AppCommand::ReplacePumps(pumps) => {
                self.reconfigure(|r| r.replace_all(pumps))?;
                Ok(AppResponse::Pumps(self.registry.list_all()))
            }
            AppCommand::SetFlowRate { pump, ml_per_sec } => {
                self.reconfigure(|r| r.set_flow_rate(pump, ml_per_sec))?;
                Ok(AppResponse::FlowRate { pump, ml_per_sec })
            }
            AppCommand::SetEnabled { pump, enabled } => {
                self.reconfigure(|r| r.set_enabled(pump, enabled))?;
                Ok(AppResponse::Ack)
            }

            AppCommand::CalibrationTest { pump, duration_ms } => self
                .calibration
                .run_test(pump, duration_ms)
                .map(AppResponse::CalibrationRun),
            AppCommand::CompleteCalibration { run, measured_ml } => {
                let ml_per_sec = self.calibration.complete(run, measured_ml)?;
                Ok(AppResponse::FlowRate {
                    pump: run.pump,
                    ml_per_sec,
                })
            }
            AppCommand::Vent { pump, duration_ms } => {
                let duration_ms = self.calibration.vent(pump, duration_ms)?;
                Ok(AppResponse::Ran { pump, duration_ms })
            }
            AppCommand::Clean { pump, duration_ms } => {
                self.calibration.clean(pump, duration_ms)?;
                Ok(AppResponse::Ran { pump, duration_ms })
            }
        }
    }

    /// Edit the pump table while holding the rig, so a running job never
    /// sees it change.
    fn reconfigure<T>(&self, edit: impl FnOnce(&PumpRegistry) -> Result<T>) -> Result<T> {
        let _gate = self.gate.try_acquire(RigOperation::Reconfigure)?;
        edit(&self.registry)
    }

    // ── Queries ───────────────────────────────────────────────

    pub fn config(&self) -> &DispenserConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PumpRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<IngredientLedger> {
        &self.ledger
    }

    pub fn orchestrator(&self) -> &Orchestrator<A> {
        &self.orchestrator
    }

    pub fn calibration(&self) -> &CalibrationService<A> {
        &self.calibration
    }

    // ── Persistence ───────────────────────────────────────────

    /// Write any state a failed write-through left dirty.
    pub fn flush(&self) -> bool {
        flush_dirty(&self.registry, &self.ledger)
    }
}

//! Dispense orchestrator.
//!
//! Runs one job at a time on the calling thread. Each pour phase is
//! drained by a small pool of worker tasks on an `edge-executor` local
//! executor, so at most `maxConcurrentPumps` pumps are energised at once.
//!
//! ```text
//!  caller thread
//!  ┌───────────────────────────────────────────────────────────────┐
//!  │  RigGate::try_acquire(Dispense)                               │
//!  │  Pending ─▶ Planning (plan + stock pre-check) ─▶ Dispensing   │
//!  │  ┌─────────────────────────────────────────────────────────┐  │
//!  │  │  per stage: futures_lite::block_on(...)                 │  │
//!  │  │                                                         │  │
//!  │  │  Pour ─▶ LocalExecutor [worker 0] [worker 1] ◀── queue  │  │
//!  │  │  Settle ─▶ Timer (abort-aware)                          │  │
//!  │  │  Manual ─▶ wait for resume() / abort()                  │  │
//!  │  └─────────────────────────────────────────────────────────┘  │
//!  │  ─▶ Completed | PartiallyCompleted | Failed | Aborted         │
//!  └───────────────────────────────────────────────────────────────┘
//!        ▲ abort() / resume() / status() from any other thread
//! ```
//!
//! Stock is deducted only after the actuator reports completion. An
//! aborted actuation is switched off and never committed. Commits land in
//! memory while pumps run; the ledger is written to the store once each
//! pour phase has drained.

pub mod plan;
pub mod state;

use core::cell::{Cell, RefCell};
use core::pin::pin;
use core::time::Duration;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_io_mini::Timer;
use edge_executor::LocalExecutor;
use futures_lite::future::{block_on, or};
use log::{debug, info, warn};
use serde::{Serialize, Serializer};

use crate::app::events::DispenseEvent;
use crate::app::ports::{ActuationOutcome, ActuatorPort, EventSink};
use crate::availability::{Availability, AvailabilityEvaluator};
use crate::config::DispenserConfig;
use crate::error::{Error, Result};
use crate::gate::{RigGate, RigOperation};
use crate::ledger::IngredientLedger;
use crate::recipe::Recipe;
use crate::registry::{PumpId, PumpRegistry};

use plan::{Actuation, DispensePlan, Stage, build_plan};
use state::{JobControl, JobState, JobStatus, PendingManual};

/// Executor queue depth. Workers are capped well below this by config
/// validation (1-16).
const EXECUTOR_SLOTS: usize = 32;

// ---------------------------------------------------------------------------
// Result types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum DispenseStatus {
    Completed,
    PartiallyCompleted,
    Failed,
    Aborted,
}

impl DispenseStatus {
    fn final_state(self) -> JobState {
        match self {
            Self::Completed => JobState::Completed,
            Self::PartiallyCompleted => JobState::PartiallyCompleted,
            Self::Failed => JobState::Failed,
            Self::Aborted => JobState::Aborted,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedActuation {
    pub pump: PumpId,
    pub ingredient: String,
    pub reason: String,
}

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DispenseResult {
    pub recipe_id: String,
    pub status: DispenseStatus,
    /// Committed volume per ingredient.
    pub dispensed_by_ingredient: BTreeMap<String, f32>,
    pub failed_actuations: Vec<FailedActuation>,
    #[serde(serialize_with = "serialize_error", skip_serializing_if = "Option::is_none")]
    pub error: Option<Error>,
}

impl DispenseResult {
    fn failed(recipe_id: &str, error: Error) -> Self {
        Self {
            recipe_id: recipe_id.to_string(),
            status: DispenseStatus::Failed,
            dispensed_by_ingredient: BTreeMap::new(),
            failed_actuations: Vec::new(),
            error: Some(error),
        }
    }

    pub fn total_dispensed_ml(&self) -> f32 {
        self.dispensed_by_ingredient.values().sum()
    }
}

fn serialize_error<S: Serializer>(e: &Option<Error>, s: S) -> core::result::Result<S::Ok, S::Error> {
    match e {
        Some(e) => s.collect_str(e),
        None => s.serialize_none(),
    }
}

// ---------------------------------------------------------------------------
// Per-job bookkeeping (single-threaded, shared by the worker tasks)
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Tally {
    dispensed: BTreeMap<String, f32>,
    failed: Vec<FailedActuation>,
    shortfall: Option<Error>,
}

#[derive(Default)]
struct JobRun {
    queue: RefCell<VecDeque<Actuation>>,
    /// Set on a stock shortfall: no new starts for the rest of the job.
    halted: Cell<bool>,
    tally: RefCell<Tally>,
}

impl JobRun {
    fn next(&self) -> Option<Actuation> {
        if self.halted.get() {
            return None;
        }
        self.queue.borrow_mut().pop_front()
    }

    fn record_dispensed(&self, ingredient: &str, ml: f32) {
        *self
            .tally
            .borrow_mut()
            .dispensed
            .entry(ingredient.to_string())
            .or_insert(0.0) += ml;
    }

    fn record_failure(&self, failure: FailedActuation) {
        self.tally.borrow_mut().failed.push(failure);
    }

    fn record_shortfall(&self, e: Error) {
        self.halted.set(true);
        self.queue.borrow_mut().clear();
        self.tally.borrow_mut().shortfall.get_or_insert(e);
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct Orchestrator<A> {
    registry: Arc<PumpRegistry>,
    ledger: Arc<IngredientLedger>,
    actuator: Arc<A>,
    sink: Arc<dyn EventSink + Send + Sync>,
    gate: Arc<RigGate>,
    evaluator: AvailabilityEvaluator,
    cfg: DispenserConfig,
    current: Mutex<Option<Arc<JobControl>>>,
}

impl<A: ActuatorPort> Orchestrator<A> {
    pub fn new(
        registry: Arc<PumpRegistry>,
        ledger: Arc<IngredientLedger>,
        actuator: Arc<A>,
        sink: Arc<dyn EventSink + Send + Sync>,
        gate: Arc<RigGate>,
        cfg: DispenserConfig,
    ) -> Self {
        let evaluator =
            AvailabilityEvaluator::new(registry.clone(), ledger.clone(), cfg.low_stock_fraction);
        Self {
            registry,
            ledger,
            actuator,
            sink,
            gate,
            evaluator,
            cfg,
            current: Mutex::new(None),
        }
    }

    /// Feasibility of `recipe` at `size_ml` against current stock.
    pub fn availability(&self, recipe: &Recipe, size_ml: f32) -> Result<Availability> {
        self.evaluator.evaluate(recipe, size_ml)
    }

    /// Pour `recipe` at `size_ml`. Blocks until the job reaches a terminal
    /// state.
    ///
    /// Returns `Err` without touching the rig for rejected requests (rig
    /// busy, bad size, missing pump, out-of-range duration). Insufficient
    /// stock at planning time is a `Failed` result, not an error.
    pub fn dispense(&self, recipe: &Recipe, size_ml: f32) -> Result<DispenseResult> {
        let _gate = self.gate.try_acquire(RigOperation::Dispense)?;
        let ctl = Arc::new(JobControl::new());
        *self.current() = Some(ctl.clone());

        let result = self.run_job(&ctl, recipe, size_ml);

        *self.current() = None;
        result
    }

    /// Single automatic step of `amount_ml`.
    pub fn dispense_shot(&self, ingredient: &str, amount_ml: f32) -> Result<DispenseResult> {
        self.dispense(&Recipe::shot(ingredient, amount_ml), amount_ml)
    }

    /// Cancel the running job.
    pub fn abort(&self) -> Result<()> {
        self.running("abort")?.request_abort()
    }

    /// Acknowledge the pending manual step of the running job.
    pub fn resume(&self) -> Result<()> {
        self.running("resume")?.request_resume()
    }

    /// State of the running job, if any.
    pub fn status(&self) -> Option<JobStatus> {
        self.current().as_ref().map(|c| c.status())
    }

    // -- job lifecycle ------------------------------------------------------

    fn run_job(&self, ctl: &JobControl, recipe: &Recipe, size_ml: f32) -> Result<DispenseResult> {
        info!("Dispense: '{}' at {:.0} ml", recipe.id, size_ml);
        ctl.transition(JobState::Planning, &*self.sink);

        let plan = match self.prepare(recipe, size_ml) {
            Ok(Ok(plan)) => plan,
            Ok(Err(shortfall)) => {
                warn!("Dispense: '{}' rejected: {}", recipe.id, shortfall);
                ctl.transition(JobState::Failed, &*self.sink);
                return Ok(DispenseResult::failed(&recipe.id, shortfall));
            }
            Err(e) => {
                warn!("Dispense: '{}' not planned: {}", recipe.id, e);
                ctl.transition(JobState::Failed, &*self.sink);
                return Err(e);
            }
        };

        ctl.transition(JobState::Dispensing, &*self.sink);
        let run = JobRun::default();
        self.run_stages(ctl, &plan, &run);

        let aborted = ctl.abort_requested();
        if aborted {
            self.enter_aborting(ctl);
            self.actuator.all_off();
        }
        self.persist_commits();
        let tally = run.tally.into_inner();
        let result = self.finish(&plan, tally, aborted);
        ctl.transition(result.status.final_state(), &*self.sink);
        info!(
            "Dispense: '{}' {:?}, {:.1} ml committed",
            result.recipe_id,
            result.status,
            result.total_dispensed_ml()
        );
        Ok(result)
    }

    /// Build the plan and run the stock pre-check. The inner `Err` is a
    /// stock shortfall, which fails the job without being a rejection.
    fn prepare(&self, recipe: &Recipe, size_ml: f32) -> Result<core::result::Result<DispensePlan, Error>> {
        let plan = build_plan(recipe, size_ml, &self.registry, &self.cfg)?;
        let availability = self.evaluator.evaluate(recipe, size_ml)?;

        if let Some(ingredient) = availability.unpumped_ingredients.first() {
            return Err(Error::config(format!(
                "no enabled pump for ingredient '{ingredient}'"
            )));
        }
        if let Some(ingredient) = availability.missing_ingredients.first() {
            let requested_ml = recipe
                .requirements(size_ml)?
                .into_iter()
                .find(|(id, _)| id == ingredient)
                .map_or(0.0, |(_, ml)| ml);
            let available_ml = self.ledger.get(ingredient).current_amount_ml;
            return Ok(Err(Error::InsufficientStock {
                ingredient: ingredient.clone(),
                requested_ml,
                available_ml,
            }));
        }
        for ingredient in &availability.low_ingredients {
            warn!("Dispense: '{}' will be low after this pour", ingredient);
        }
        Ok(Ok(plan))
    }

    fn finish(&self, plan: &DispensePlan, tally: Tally, aborted: bool) -> DispenseResult {
        let total: f32 = tally.dispensed.values().sum();
        let clean = tally.failed.is_empty() && tally.shortfall.is_none();
        let status = if aborted {
            DispenseStatus::Aborted
        } else if clean {
            DispenseStatus::Completed
        } else if total > 0.0 {
            DispenseStatus::PartiallyCompleted
        } else {
            DispenseStatus::Failed
        };
        let error = tally.shortfall.or_else(|| {
            tally.failed.first().map(|f| Error::Actuation {
                pump: f.pump,
                reason: f.reason.clone(),
            })
        });
        DispenseResult {
            recipe_id: plan.recipe_id.clone(),
            status,
            dispensed_by_ingredient: tally.dispensed,
            failed_actuations: tally.failed,
            error,
        }
    }

    // -- stage runner -------------------------------------------------------

    fn run_stages(&self, ctl: &JobControl, plan: &DispensePlan, run: &JobRun) {
        for stage in &plan.stages {
            if ctl.abort_requested() {
                return;
            }
            match stage {
                Stage::Pour { kind, actuations } => {
                    let workers = self.cfg.max_concurrent_pumps.min(actuations.len());
                    debug!(
                        "Dispense: {:?} phase, {} actuations on {} workers",
                        kind,
                        actuations.len(),
                        workers
                    );
                    run.queue.borrow_mut().extend(actuations.iter().cloned());

                    let executor: LocalExecutor<'_, EXECUTOR_SLOTS> = LocalExecutor::new();
                    let tasks: Vec<_> = (0..workers)
                        .map(|id| executor.spawn(self.worker(id, ctl, run)))
                        .collect();
                    block_on(executor.run(async move {
                        for task in tasks {
                            task.await;
                        }
                    }));
                    self.persist_commits();

                    if run.halted.get() {
                        info!("Dispense: stock shortfall, no further phases");
                        return;
                    }
                }
                Stage::Settle { ms } => {
                    debug!("Dispense: settling {} ms", ms);
                    block_on(or(
                        async {
                            Timer::after(Duration::from_millis(u64::from(*ms))).await;
                        },
                        self.wait_abort(ctl),
                    ));
                }
                Stage::Manual {
                    ingredient,
                    instruction,
                } => {
                    ctl.set_pending_manual(Some(PendingManual {
                        ingredient: ingredient.clone(),
                        instruction: instruction.clone(),
                    }));
                    if ctl.abort_requested() {
                        return;
                    }
                    info!(
                        "Dispense: waiting for operator ({}: {})",
                        ingredient,
                        instruction.as_deref().unwrap_or("-")
                    );
                    self.sink.emit(&DispenseEvent::ManualStepPending {
                        ingredient: ingredient.clone(),
                        instruction: instruction.clone(),
                    });
                    block_on(ctl.wait_resume());
                    ctl.set_pending_manual(None);
                    if ctl.abort_requested() {
                        return;
                    }
                    self.sink.emit(&DispenseEvent::ManualStepAcknowledged {
                        ingredient: ingredient.clone(),
                    });
                }
            }
        }
    }

    async fn worker(&self, id: usize, ctl: &JobControl, run: &JobRun) {
        while !ctl.abort_requested() {
            let Some(act) = run.next() else {
                break;
            };
            if !self.actuate(id, ctl, run, &act).await {
                break;
            }
        }
        debug!("Worker {}: done", id);
    }

    /// Run one actuation and commit it. Returns `false` when the worker
    /// should stop taking work.
    async fn actuate(&self, worker: usize, ctl: &JobControl, run: &JobRun, act: &Actuation) -> bool {
        let ingredient = act.ingredient();
        let pump = act.pump.id;

        let available_ml = self.ledger.get(ingredient).current_amount_ml;
        if available_ml < act.volume_ml {
            warn!(
                "Worker {}: '{}' has {:.1} ml, needs {:.1} ml; not starting pump {}",
                worker, ingredient, available_ml, act.volume_ml, pump
            );
            self.stock_exhausted(run, ingredient, act.volume_ml, available_ml);
            return false;
        }

        debug!(
            "Worker {}: pump {} on for {} ms ({:.1} ml {})",
            worker, pump, act.duration_ms, act.volume_ml, ingredient
        );
        self.sink.emit(&DispenseEvent::ActuationStarted {
            pump,
            ingredient: ingredient.to_string(),
            volume_ml: act.volume_ml,
            duration_ms: act.duration_ms,
        });

        let mut activation = pin!(self.actuator.activate(&act.pump, act.duration_ms));
        let raced = or(async { Some(activation.as_mut().await) }, async {
            self.wait_abort(ctl).await;
            None
        })
        .await;

        let Some(outcome) = raced else {
            self.enter_aborting(ctl);
            self.actuator.deactivate(pump);
            let _ = activation.as_mut().await;
            info!("Worker {}: pump {} stopped by abort, not committed", worker, pump);
            return false;
        };

        match outcome {
            ActuationOutcome::Completed { actual_volume_ml } => {
                self.commit(run, act, actual_volume_ml.unwrap_or(act.volume_ml))
            }
            ActuationOutcome::Failed { reason } => {
                warn!("Worker {}: pump {} failed: {}", worker, pump, reason);
                self.sink.emit(&DispenseEvent::ActuationFailed {
                    pump,
                    ingredient: ingredient.to_string(),
                    reason: reason.to_string(),
                });
                run.record_failure(FailedActuation {
                    pump,
                    ingredient: ingredient.to_string(),
                    reason: reason.to_string(),
                });
                true
            }
        }
    }

    fn commit(&self, run: &JobRun, act: &Actuation, ml: f32) -> bool {
        let ingredient = act.ingredient();
        match self.ledger.deduct_deferred(ingredient, ml) {
            Ok(remaining_ml) => {
                run.record_dispensed(ingredient, ml);
                self.sink.emit(&DispenseEvent::ActuationCommitted {
                    pump: act.pump.id,
                    ingredient: ingredient.to_string(),
                    dispensed_ml: ml,
                    remaining_ml,
                });
                let capacity_ml = self.ledger.get(ingredient).capacity_ml;
                if remaining_ml < self.cfg.low_stock_fraction * capacity_ml {
                    self.sink.emit(&DispenseEvent::StockLow {
                        ingredient: ingredient.to_string(),
                        remaining_ml,
                        capacity_ml,
                    });
                }
                true
            }
            Err(Error::InsufficientStock {
                requested_ml,
                available_ml,
                ..
            }) => {
                warn!(
                    "Dispense: '{}' ran dry during pour ({:.1} of {:.1} ml on record), counting 0 ml",
                    ingredient, available_ml, requested_ml
                );
                self.stock_exhausted(run, ingredient, requested_ml, available_ml);
                false
            }
            Err(e) => {
                warn!("Dispense: could not commit pump {}: {}", act.pump.id, e);
                run.record_failure(FailedActuation {
                    pump: act.pump.id,
                    ingredient: ingredient.to_string(),
                    reason: e.to_string(),
                });
                true
            }
        }
    }

    /// Write back what the phase committed. Runs with every pump off, so a
    /// slow store never holds up an actuation.
    fn persist_commits(&self) {
        if !self.ledger.flush() {
            warn!("Dispense: levels kept in memory, store write failed");
        }
    }

    fn stock_exhausted(&self, run: &JobRun, ingredient: &str, requested_ml: f32, available_ml: f32) {
        self.sink.emit(&DispenseEvent::StockExhausted {
            ingredient: ingredient.to_string(),
            requested_ml,
            available_ml,
        });
        run.record_shortfall(Error::InsufficientStock {
            ingredient: ingredient.to_string(),
            requested_ml,
            available_ml,
        });
    }

    async fn wait_abort(&self, ctl: &JobControl) {
        let poll = Duration::from_millis(u64::from(self.cfg.abort_poll_ms));
        while !ctl.abort_requested() {
            Timer::after(poll).await;
        }
    }

    fn enter_aborting(&self, ctl: &JobControl) {
        if ctl.state() == JobState::Dispensing {
            ctl.transition(JobState::Aborting, &*self.sink);
        }
    }

    // -- helpers ------------------------------------------------------------

    fn running(&self, action: &'static str) -> Result<Arc<JobControl>> {
        self.current().clone().ok_or(Error::InvalidState {
            action,
            state: "idle".to_string(),
        })
    }

    fn current(&self) -> MutexGuard<'_, Option<Arc<JobControl>>> {
        self.current.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//! Dispense planning.
//!
//! Turns a recipe and a serving size into an ordered list of stages:
//!
//! ```text
//!  steps:  A  B  C(delayed)  [manual: garnish]  D  E(delayed)
//!
//!  stages: Pour[A,B] ─ Settle ─ Pour[C] ─ Manual ─ Pour[D] ─ Settle ─ Pour[E]
//!          └──── segment 1 ────────────┘          └──── segment 2 ─────────┘
//! ```
//!
//! Each manual step closes a segment. Within a segment the non-delayed
//! steps form the immediate phase and the delayed steps the delayed phase,
//! which is preceded by a settle pause so layers can separate.

use log::debug;

use crate::config::DispenserConfig;
use crate::error::{Error, Result};
use crate::recipe::{Recipe, StepKind};
use crate::registry::{PumpConfig, PumpRegistry};

/// One timed pump run.
#[derive(Debug, Clone, PartialEq)]
pub struct Actuation {
    pub pump: PumpConfig,
    pub volume_ml: f32,
    pub duration_ms: u32,
}

impl Actuation {
    pub fn ingredient(&self) -> &str {
        &self.pump.ingredient_id
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseKind {
    Immediate,
    Delayed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Actuations that may run concurrently.
    Pour {
        kind: PhaseKind,
        actuations: Vec<Actuation>,
    },
    /// Fixed pause before a delayed phase.
    Settle { ms: u32 },
    /// Operator action; the job waits for `resume()`.
    Manual {
        ingredient: String,
        instruction: Option<String>,
    },
}

/// Ordered stages for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct DispensePlan {
    pub recipe_id: String,
    pub size_ml: f32,
    pub stages: Vec<Stage>,
}

impl DispensePlan {
    pub fn actuations(&self) -> impl Iterator<Item = &Actuation> {
        self.stages.iter().flat_map(|s| match s {
            Stage::Pour { actuations, .. } => actuations.as_slice(),
            _ => &[],
        })
    }

    pub fn total_volume_ml(&self) -> f32 {
        self.actuations().map(|a| a.volume_ml).sum()
    }
}

/// Pump-on time for `volume_ml` at the pump's calibrated flow rate.
pub fn duration_for(volume_ml: f32, flow_rate_ml_per_sec: f32) -> f64 {
    (f64::from(volume_ml) / f64::from(flow_rate_ml_per_sec) * 1000.0).round()
}

/// Build the plan. Every automatic ingredient must have an enabled pump;
/// stock is not consulted here.
pub fn build_plan(
    recipe: &Recipe,
    size_ml: f32,
    registry: &PumpRegistry,
    cfg: &DispenserConfig,
) -> Result<DispensePlan> {
    recipe.validate()?;
    let factor = recipe.scale_factor(size_ml)?;

    let mut stages = Vec::new();
    let mut immediate = Vec::new();
    let mut delayed = Vec::new();

    for step in &recipe.steps {
        if step.kind == StepKind::Manual {
            close_segment(&mut stages, &mut immediate, &mut delayed, cfg);
            stages.push(Stage::Manual {
                ingredient: step.ingredient_id.clone(),
                instruction: step.instruction.clone(),
            });
            continue;
        }

        let volume_ml = step.amount_ml * factor;
        if volume_ml <= 0.0 {
            debug!("Plan: skipping zero-volume step '{}'", step.ingredient_id);
            continue;
        }

        let pump = registry.get_pump(&step.ingredient_id).ok_or_else(|| {
            Error::config(format!(
                "no enabled pump for ingredient '{}'",
                step.ingredient_id
            ))
        })?;

        let raw_ms = f64::from(volume_ml) / f64::from(pump.flow_rate_ml_per_sec) * 1000.0;
        if raw_ms < f64::from(cfg.min_actuation_ms) {
            return Err(Error::config(format!(
                "volume too small to dispense accurately ({volume_ml:.3} ml of '{}')",
                step.ingredient_id
            )));
        }
        let duration = duration_for(volume_ml, pump.flow_rate_ml_per_sec);
        if duration > f64::from(cfg.max_actuation_ms) {
            return Err(Error::config(format!(
                "'{}' would run pump {} for {duration:.0} ms, limit is {} ms",
                step.ingredient_id, pump.id, cfg.max_actuation_ms
            )));
        }

        let actuation = Actuation {
            pump,
            volume_ml,
            duration_ms: duration as u32,
        };
        if step.delayed {
            delayed.push(actuation);
        } else {
            immediate.push(actuation);
        }
    }
    close_segment(&mut stages, &mut immediate, &mut delayed, cfg);

    let plan = DispensePlan {
        recipe_id: recipe.id.clone(),
        size_ml,
        stages,
    };
    debug!(
        "Plan: '{}' at {:.0} ml -> {} stages, {:.1} ml total",
        plan.recipe_id,
        size_ml,
        plan.stages.len(),
        plan.total_volume_ml()
    );
    Ok(plan)
}

fn close_segment(
    stages: &mut Vec<Stage>,
    immediate: &mut Vec<Actuation>,
    delayed: &mut Vec<Actuation>,
    cfg: &DispenserConfig,
) {
    if !immediate.is_empty() {
        stages.push(Stage::Pour {
            kind: PhaseKind::Immediate,
            actuations: core::mem::take(immediate),
        });
    }
    if !delayed.is_empty() {
        if cfg.delayed_phase_settle_ms > 0 {
            stages.push(Stage::Settle {
                ms: cfg.delayed_phase_settle_ms,
            });
        }
        stages.push(Stage::Pour {
            kind: PhaseKind::Delayed,
            actuations: core::mem::take(delayed),
        });
    }
}

//! Availability evaluator.
//!
//! Derives whether a recipe can be poured at a given size from the pump
//! table and current stock. Pure: no side effects, safe at any rate.
//!
//! Classification per required ingredient, in priority order:
//!
//! 1. no enabled pump, or `current < required`  → **missing** (`can_make = false`)
//! 2. `current - required < low_fraction * capacity` → **low**

use std::sync::Arc;

use log::debug;
use serde::Serialize;

use crate::error::Result;
use crate::ledger::IngredientLedger;
use crate::recipe::Recipe;
use crate::registry::PumpRegistry;

/// Feasibility of a recipe against current stock.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Availability {
    pub can_make: bool,
    pub low_ingredients: Vec<String>,
    pub missing_ingredients: Vec<String>,
    /// Subset of `missing_ingredients` whose pump is absent or disabled.
    #[serde(skip)]
    pub unpumped_ingredients: Vec<String>,
}

pub struct AvailabilityEvaluator {
    registry: Arc<PumpRegistry>,
    ledger: Arc<IngredientLedger>,
    low_fraction: f32,
}

impl AvailabilityEvaluator {
    pub fn new(registry: Arc<PumpRegistry>, ledger: Arc<IngredientLedger>, low_fraction: f32) -> Self {
        Self {
            registry,
            ledger,
            low_fraction,
        }
    }

    /// Classify every automatic ingredient of `recipe` at `size_ml`.
    /// Fails only on malformed input (non-positive size).
    pub fn evaluate(&self, recipe: &Recipe, size_ml: f32) -> Result<Availability> {
        let mut out = Availability::default();

        for (ingredient, required) in recipe.requirements(size_ml)? {
            if self.registry.get_pump(&ingredient).is_none() {
                debug!("Availability: '{}' has no enabled pump", ingredient);
                out.unpumped_ingredients.push(ingredient.clone());
                out.missing_ingredients.push(ingredient);
                continue;
            }

            let level = self.ledger.get(&ingredient);
            if level.current_amount_ml < required {
                debug!(
                    "Availability: '{}' missing ({:.1} < {:.1} ml)",
                    ingredient, level.current_amount_ml, required
                );
                out.missing_ingredients.push(ingredient);
            } else if level.current_amount_ml - required < self.low_fraction * level.capacity_ml {
                debug!(
                    "Availability: '{}' low ({:.1} ml left after pour)",
                    ingredient,
                    level.current_amount_ml - required
                );
                out.low_ingredients.push(ingredient);
            }
        }

        out.can_make = out.missing_ingredients.is_empty();
        Ok(out)
    }
}

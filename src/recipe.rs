//! Recipe model.
//!
//! A recipe is an ordered list of steps expressed for a reference volume
//! (`base_size_ml`). Automatic steps are poured by pumps; manual steps are
//! operator actions (garnish, ice) that pause the job until acknowledged.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Who performs a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepKind {
    /// Poured by the ingredient's pump.
    #[default]
    Automatic,
    /// Performed by the operator; never produces an actuation.
    Manual,
}

/// One line of a recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecipeStep {
    pub ingredient_id: String,
    #[serde(rename = "amount")]
    pub amount_ml: f32,
    #[serde(rename = "type", default)]
    pub kind: StepKind,
    /// Poured after the non-delayed steps of its segment (layering).
    #[serde(default)]
    pub delayed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instruction: Option<String>,
}

impl RecipeStep {
    pub fn automatic(ingredient: &str, amount_ml: f32) -> Self {
        Self {
            ingredient_id: ingredient.to_string(),
            amount_ml,
            kind: StepKind::Automatic,
            delayed: false,
            instruction: None,
        }
    }

    pub fn delayed(ingredient: &str, amount_ml: f32) -> Self {
        Self {
            delayed: true,
            ..Self::automatic(ingredient, amount_ml)
        }
    }

    pub fn manual(ingredient: &str, instruction: &str) -> Self {
        Self {
            ingredient_id: ingredient.to_string(),
            amount_ml: 0.0,
            kind: StepKind::Manual,
            delayed: false,
            instruction: Some(instruction.to_string()),
        }
    }

    pub fn is_automatic(&self) -> bool {
        self.kind == StepKind::Automatic
    }
}

/// A drink recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Recipe {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "recipe")]
    pub steps: Vec<RecipeStep>,
    /// Reference volume the step amounts are written for. When absent the
    /// sum of all step amounts is used.
    #[serde(rename = "baseSize", default, skip_serializing_if = "Option::is_none")]
    pub base_size_ml: Option<f32>,
}

impl Recipe {
    pub fn new(id: &str, steps: Vec<RecipeStep>) -> Self {
        Self {
            id: id.to_string(),
            name: id.to_string(),
            steps,
            base_size_ml: None,
        }
    }

    #[must_use]
    pub fn with_base_size(mut self, base_size_ml: f32) -> Self {
        self.base_size_ml = Some(base_size_ml);
        self
    }

    /// Single-ingredient recipe poured at exactly `amount_ml`.
    pub fn shot(ingredient: &str, amount_ml: f32) -> Self {
        Self::new(
            &format!("shot-{ingredient}"),
            vec![RecipeStep::automatic(ingredient, amount_ml)],
        )
        .with_base_size(amount_ml)
    }

    /// Effective reference volume.
    pub fn base_size(&self) -> f32 {
        self.base_size_ml
            .unwrap_or_else(|| self.steps.iter().map(|s| s.amount_ml).sum())
    }

    /// Factor applied to every automatic step for a serving of `size_ml`.
    /// A recipe whose amounts sum to zero is served unscaled.
    pub fn scale_factor(&self, size_ml: f32) -> Result<f32> {
        if !(size_ml.is_finite() && size_ml > 0.0) {
            return Err(Error::config(format!("serving size must be > 0 ml, got {size_ml}")));
        }
        let base = self.base_size();
        if !base.is_finite() || base < 0.0 {
            return Err(Error::config(format!(
                "recipe '{}': base size {base} is invalid",
                self.id
            )));
        }
        if base == 0.0 {
            return Ok(1.0);
        }
        Ok(size_ml / base)
    }

    /// Reject malformed step data before anything is planned.
    pub fn validate(&self) -> Result<()> {
        if self.steps.is_empty() {
            return Err(Error::config(format!("recipe '{}' has no steps", self.id)));
        }
        for step in &self.steps {
            if step.ingredient_id.trim().is_empty() {
                return Err(Error::config(format!(
                    "recipe '{}': step with empty ingredient",
                    self.id
                )));
            }
            if !(step.amount_ml.is_finite() && step.amount_ml >= 0.0) {
                return Err(Error::config(format!(
                    "recipe '{}': amount for '{}' must be >= 0",
                    self.id, step.ingredient_id
                )));
            }
        }
        if let Some(base) = self.base_size_ml {
            if !(base.is_finite() && base > 0.0) {
                return Err(Error::config(format!(
                    "recipe '{}': baseSize must be > 0",
                    self.id
                )));
            }
        }
        Ok(())
    }

    /// Scaled requirement per ingredient for a serving of `size_ml`, in
    /// first-appearance order. Repeated ingredients are summed; manual
    /// steps are skipped.
    pub fn requirements(&self, size_ml: f32) -> Result<Vec<(String, f32)>> {
        let factor = self.scale_factor(size_ml)?;
        let mut out: Vec<(String, f32)> = Vec::new();
        for step in self.steps.iter().filter(|s| s.is_automatic()) {
            let ml = step.amount_ml * factor;
            match out.iter_mut().find(|(id, _)| *id == step.ingredient_id) {
                Some((_, total)) => *total += ml,
                None => out.push((step.ingredient_id.clone(), ml)),
            }
        }
        Ok(out)
    }
}

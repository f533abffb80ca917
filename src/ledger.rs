//! Ingredient ledger.
//!
//! The authoritative record of remaining and maximum volume per ingredient.
//!
//! ## Invariant
//!
//! `0 <= current_amount_ml <= capacity_ml` holds for every row before and
//! after every operation. It is enforced inside each mutation while the
//! row's lock is held, never patched up on read.
//!
//! ## Locking
//!
//! Each ingredient row sits behind its own mutex, so a refill on one
//! ingredient never waits for a deduction on another. The row map itself
//! is locked only long enough to find or create a row, or, on import, to
//! overwrite rows in place. Persistence snapshots are serialized by a
//! separate lock so a newer snapshot can never be overwritten by an older
//! one.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::StorePort;
use crate::error::{Error, Result};

/// Stock row for one ingredient. Serialized in the flat backup format
/// `{ingredientId, currentAmount, capacity, lastRefill}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngredientLevel {
    pub ingredient_id: String,
    #[serde(rename = "currentAmount")]
    pub current_amount_ml: f32,
    #[serde(rename = "capacity")]
    pub capacity_ml: f32,
    pub last_refill: DateTime<Utc>,
}

impl IngredientLevel {
    /// An empty reservoir of the given capacity.
    pub fn empty(ingredient: &str, capacity_ml: f32) -> Self {
        Self {
            ingredient_id: ingredient.to_string(),
            current_amount_ml: 0.0,
            capacity_ml,
            last_refill: Utc::now(),
        }
    }

    /// Fraction of capacity remaining (0.0-1.0).
    pub fn fill_fraction(&self) -> f32 {
        self.current_amount_ml / self.capacity_ml
    }
}

type Row = Arc<Mutex<IngredientLevel>>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn check_volume(what: &str, ml: f32) -> Result<()> {
    if ml.is_finite() && ml >= 0.0 {
        Ok(())
    } else {
        Err(Error::config(format!("{what} must be a finite volume >= 0, got {ml}")))
    }
}

fn check_capacity(ml: f32) -> Result<()> {
    if ml.is_finite() && ml > 0.0 {
        Ok(())
    } else {
        Err(Error::config(format!("capacity must be > 0 ml, got {ml}")))
    }
}

/// Per-ingredient stock ledger with write-through persistence.
pub struct IngredientLedger {
    rows: Mutex<BTreeMap<String, Row>>,
    default_capacity_ml: f32,
    store: Arc<dyn StorePort>,
    persist_lock: Mutex<()>,
    dirty: AtomicBool,
}

impl IngredientLedger {
    /// Build a ledger from stored rows. Rows are sanitized on the way in:
    /// a non-positive capacity falls back to the default and the current
    /// amount is clamped into bounds.
    pub fn new(
        levels: Vec<IngredientLevel>,
        default_capacity_ml: f32,
        store: Arc<dyn StorePort>,
    ) -> Self {
        let rows = levels
            .into_iter()
            .map(|l| {
                let l = sanitize(l, default_capacity_ml);
                (l.ingredient_id.clone(), Arc::new(Mutex::new(l)))
            })
            .collect();
        Self {
            rows: Mutex::new(rows),
            default_capacity_ml,
            store,
            persist_lock: Mutex::new(()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Load rows from the store; an unreachable store yields an empty
    /// ledger (rows materialize lazily) rather than an error.
    pub fn load(default_capacity_ml: f32, store: Arc<dyn StorePort>) -> Self {
        let levels = match store.load_levels() {
            Ok(levels) => {
                info!("Ledger: loaded {} ingredient levels", levels.len());
                levels
            }
            Err(e) => {
                warn!("Ledger: store unavailable ({}), starting empty", e);
                Vec::new()
            }
        };
        Self::new(levels, default_capacity_ml, store)
    }

    /// Current row for `ingredient`. Unknown ingredients are materialized
    /// as empty with the default capacity.
    pub fn get(&self, ingredient: &str) -> IngredientLevel {
        lock(&self.row(ingredient)).clone()
    }

    /// Remove `amount_ml` from stock. Fails as a whole with
    /// [`Error::InsufficientStock`] if the row holds less; nothing is
    /// deducted in that case.
    pub fn deduct(&self, ingredient: &str, amount_ml: f32) -> Result<f32> {
        let remaining = self.take(ingredient, amount_ml)?;
        self.persist();
        Ok(remaining)
    }

    /// Same as [`deduct`](Self::deduct), but only marks the ledger dirty.
    /// Used while pumps are running; the caller flushes once they are off.
    pub fn deduct_deferred(&self, ingredient: &str, amount_ml: f32) -> Result<f32> {
        let remaining = self.take(ingredient, amount_ml)?;
        self.dirty.store(true, Ordering::Release);
        Ok(remaining)
    }

    /// Fill `ingredient` to capacity. Idempotent.
    pub fn refill(&self, ingredient: &str) -> IngredientLevel {
        let row = self.row(ingredient);
        let level = {
            let mut level = lock(&row);
            level.current_amount_ml = level.capacity_ml;
            level.last_refill = Utc::now();
            level.clone()
        };
        info!(
            "Ledger: '{}' refilled to {:.0} ml",
            ingredient, level.capacity_ml
        );
        self.persist();
        level
    }

    /// Fill every known ingredient to capacity.
    pub fn refill_all(&self) -> Vec<IngredientLevel> {
        let now = Utc::now();
        let levels: Vec<_> = self
            .rows()
            .iter()
            .map(|row| {
                let mut level = lock(row);
                level.current_amount_ml = level.capacity_ml;
                level.last_refill = now;
                level.clone()
            })
            .collect();
        info!("Ledger: refilled all {} ingredients", levels.len());
        self.persist();
        levels
    }

    /// Change the reservoir size. The current amount is clamped down if it
    /// would exceed the new capacity.
    pub fn set_capacity(&self, ingredient: &str, capacity_ml: f32) -> Result<IngredientLevel> {
        check_capacity(capacity_ml)?;
        let row = self.row(ingredient);
        let level = {
            let mut level = lock(&row);
            level.capacity_ml = capacity_ml;
            if level.current_amount_ml > capacity_ml {
                info!(
                    "Ledger: '{}' clamped {:.1} -> {:.1} ml by new capacity",
                    ingredient, level.current_amount_ml, capacity_ml
                );
                level.current_amount_ml = capacity_ml;
            }
            level.clone()
        };
        self.persist();
        Ok(level)
    }

    /// Manual level correction (e.g. after topping up by hand).
    pub fn set_amount(&self, ingredient: &str, amount_ml: f32) -> Result<IngredientLevel> {
        check_volume("level", amount_ml)?;
        let row = self.row(ingredient);
        let level = {
            let mut level = lock(&row);
            if amount_ml > level.capacity_ml {
                return Err(Error::config(format!(
                    "level {:.1} ml exceeds capacity {:.1} ml of '{}'",
                    amount_ml, level.capacity_ml, ingredient
                )));
            }
            level.current_amount_ml = amount_ml;
            level.clone()
        };
        self.persist();
        Ok(level)
    }

    /// Copy of every row, ordered by ingredient id.
    pub fn snapshot(&self) -> Vec<IngredientLevel> {
        self.rows().iter().map(|row| lock(row).clone()).collect()
    }

    /// Replace all rows from a backup. Capacities must be positive; current
    /// amounts are clamped into bounds.
    pub fn replace_all(&self, levels: Vec<IngredientLevel>) -> Result<()> {
        for l in &levels {
            check_capacity(l.capacity_ml)
                .map_err(|_| Error::config(format!("'{}': capacity must be > 0", l.ingredient_id)))?;
            if !l.current_amount_ml.is_finite() {
                return Err(Error::config(format!(
                    "'{}': current amount is not a number",
                    l.ingredient_id
                )));
            }
        }
        {
            // Existing rows are overwritten in place so a deduction that
            // already holds a row still lands in the live ledger.
            let mut rows = lock(&self.rows);
            let keep: BTreeSet<String> = levels.iter().map(|l| l.ingredient_id.clone()).collect();
            rows.retain(|id, _| keep.contains(id));
            for l in levels {
                let l = sanitize(l, self.default_capacity_ml);
                match rows.get(&l.ingredient_id) {
                    Some(row) => *lock(row) = l,
                    None => {
                        rows.insert(l.ingredient_id.clone(), Arc::new(Mutex::new(l)));
                    }
                }
            }
        }
        info!("Ledger: levels replaced from backup");
        self.persist();
        Ok(())
    }

    /// Retry a previously failed write. Returns `true` if nothing is left
    /// unsaved.
    pub fn flush(&self) -> bool {
        if !self.dirty.load(Ordering::Acquire) {
            return true;
        }
        self.persist()
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    // ── Internal ──────────────────────────────────────────────

    fn take(&self, ingredient: &str, amount_ml: f32) -> Result<f32> {
        check_volume("deduction", amount_ml)?;
        let row = self.row(ingredient);
        let mut level = lock(&row);
        if amount_ml > level.current_amount_ml {
            return Err(Error::InsufficientStock {
                ingredient: ingredient.to_string(),
                requested_ml: amount_ml,
                available_ml: level.current_amount_ml,
            });
        }
        level.current_amount_ml = (level.current_amount_ml - amount_ml).max(0.0);
        debug!(
            "Ledger: '{}' -{:.1} ml -> {:.1} ml",
            ingredient, amount_ml, level.current_amount_ml
        );
        Ok(level.current_amount_ml)
    }

    fn row(&self, ingredient: &str) -> Row {
        let mut rows = lock(&self.rows);
        rows.entry(ingredient.to_string())
            .or_insert_with(|| {
                debug!("Ledger: materializing '{}'", ingredient);
                Arc::new(Mutex::new(IngredientLevel::empty(
                    ingredient,
                    self.default_capacity_ml,
                )))
            })
            .clone()
    }

    fn rows(&self) -> Vec<Row> {
        lock(&self.rows).values().cloned().collect()
    }

    fn persist(&self) -> bool {
        let _guard = lock(&self.persist_lock);
        let snapshot = self.snapshot();
        match self.store.save_levels(&snapshot) {
            Ok(()) => {
                self.dirty.store(false, Ordering::Release);
                true
            }
            Err(e) => {
                warn!("Ledger: {}", Error::from(e));
                self.dirty.store(true, Ordering::Release);
                false
            }
        }
    }
}

fn sanitize(mut l: IngredientLevel, default_capacity_ml: f32) -> IngredientLevel {
    if !(l.capacity_ml.is_finite() && l.capacity_ml > 0.0) {
        warn!(
            "Ledger: '{}' has invalid capacity {}, using {}",
            l.ingredient_id, l.capacity_ml, default_capacity_ml
        );
        l.capacity_ml = default_capacity_ml;
    }
    if !l.current_amount_ml.is_finite() {
        l.current_amount_ml = 0.0;
    }
    l.current_amount_ml = l.current_amount_ml.clamp(0.0, l.capacity_ml);
    l
}

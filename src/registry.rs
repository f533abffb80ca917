//! Pump registry.
//!
//! Holds the calibrated pump table. Read-only during a dispense; mutated
//! only by configuration and calibration, both of which hold the rig gate
//! (see [`crate::gate`]). Every mutation is written through
//! the [`StorePort`]; a failed write leaves the in-memory table
//! authoritative and marks it dirty for the autosave task.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app::ports::StorePort;
use crate::error::{Error, Result};

/// Pump identifier as wired on the rig.
pub type PumpId = u16;

/// One calibrated pump bound to one ingredient reservoir.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PumpConfig {
    pub id: PumpId,
    /// GPIO pin driving the relay (BCM numbering).
    pub pin: u8,
    #[serde(rename = "ingredient")]
    pub ingredient_id: String,
    #[serde(rename = "flowRate")]
    pub flow_rate_ml_per_sec: f32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Priming time used by `vent` when no duration is given.
    #[serde(rename = "ventDuration", default, skip_serializing_if = "Option::is_none")]
    pub vent_duration_ms: Option<u32>,
}

fn default_enabled() -> bool {
    true
}

impl PumpConfig {
    pub fn new(id: PumpId, pin: u8, ingredient: &str, flow_rate_ml_per_sec: f32) -> Self {
        Self {
            id,
            pin,
            ingredient_id: ingredient.to_string(),
            flow_rate_ml_per_sec,
            enabled: true,
            vent_duration_ms: None,
        }
    }
}

/// Factory table: fifteen pumps on the standard wiring harness.
pub fn default_pumps() -> Vec<PumpConfig> {
    const TABLE: [(PumpId, u8, &str, f32); 15] = [
        (1, 17, "vodka", 1.5),
        (2, 18, "dark-rum", 1.5),
        (3, 27, "malibu", 1.5),
        (4, 22, "peach-liqueur", 1.5),
        (5, 23, "tequila", 1.5),
        (6, 24, "triple-sec", 1.5),
        (7, 25, "blue-curacao", 1.5),
        (8, 4, "pitu", 1.5),
        (9, 5, "lime-juice", 1.8),
        (10, 6, "grenadine", 1.2),
        (11, 13, "vanilla-syrup", 1.2),
        (12, 19, "orange-juice", 1.8),
        (13, 26, "pineapple-juice", 1.8),
        (14, 16, "passion-fruit-juice", 1.8),
        (15, 20, "soda-water", 2.0),
    ];
    TABLE
        .iter()
        .map(|&(id, pin, ingredient, flow)| PumpConfig::new(id, pin, ingredient, flow))
        .collect()
}

fn validate_flow_rate(rate: f32) -> Result<()> {
    if rate.is_finite() && rate > 0.0 {
        Ok(())
    } else {
        Err(Error::config(format!("flow rate must be > 0 ml/s, got {rate}")))
    }
}

/// Check a full pump table: unique ids, positive flow rates, and unique
/// pins / ingredients among enabled pumps.
pub fn validate_pumps(pumps: &[PumpConfig]) -> Result<()> {
    let mut ids = HashSet::new();
    let mut pins = HashSet::new();
    let mut ingredients = HashSet::new();
    for p in pumps {
        if !ids.insert(p.id) {
            return Err(Error::config(format!("duplicate pump id {}", p.id)));
        }
        validate_flow_rate(p.flow_rate_ml_per_sec)
            .map_err(|_| Error::config(format!("pump {}: flow rate must be > 0", p.id)))?;
        if p.ingredient_id.trim().is_empty() {
            return Err(Error::config(format!("pump {}: ingredient is empty", p.id)));
        }
        if p.enabled {
            if !pins.insert(p.pin) {
                return Err(Error::config(format!(
                    "pin {} used by more than one enabled pump",
                    p.pin
                )));
            }
            if !ingredients.insert(p.ingredient_id.as_str()) {
                return Err(Error::config(format!(
                    "ingredient '{}' bound to more than one enabled pump",
                    p.ingredient_id
                )));
            }
        }
    }
    Ok(())
}

/// In-memory pump table with write-through persistence.
pub struct PumpRegistry {
    pumps: RwLock<Vec<PumpConfig>>,
    store: Arc<dyn StorePort>,
    dirty: AtomicBool,
}

impl PumpRegistry {
    /// Build a registry from an already-validated table.
    pub fn new(pumps: Vec<PumpConfig>, store: Arc<dyn StorePort>) -> Result<Self> {
        validate_pumps(&pumps)?;
        Ok(Self {
            pumps: RwLock::new(pumps),
            store,
            dirty: AtomicBool::new(false),
        })
    }

    /// Load the table from the store. Falls back to the factory table when
    /// nothing is stored, or when the store cannot be read (logged).
    pub fn load(store: Arc<dyn StorePort>) -> Result<Self> {
        let pumps = match store.load_pumps() {
            Ok(Some(pumps)) => {
                info!("PumpRegistry: loaded {} pumps from store", pumps.len());
                pumps
            }
            Ok(None) => {
                info!("PumpRegistry: no stored pump table, using defaults");
                let pumps = default_pumps();
                if let Err(e) = store.save_pumps(&pumps) {
                    warn!("PumpRegistry: could not seed store: {}", e);
                }
                pumps
            }
            Err(e) => {
                warn!("PumpRegistry: store unavailable ({}), using defaults", e);
                default_pumps()
            }
        };
        Self::new(pumps, store)
    }

    /// Enabled pump bound to `ingredient`, if any.
    pub fn get_pump(&self, ingredient: &str) -> Option<PumpConfig> {
        self.read()
            .iter()
            .find(|p| p.enabled && p.ingredient_id == ingredient)
            .cloned()
    }

    /// Pump by id, enabled or not.
    pub fn pump(&self, id: PumpId) -> Option<PumpConfig> {
        self.read().iter().find(|p| p.id == id).cloned()
    }

    pub fn list_enabled(&self) -> Vec<PumpConfig> {
        self.read().iter().filter(|p| p.enabled).cloned().collect()
    }

    pub fn list_all(&self) -> Vec<PumpConfig> {
        self.read().clone()
    }

    /// Update a pump's calibrated flow rate.
    pub fn set_flow_rate(&self, id: PumpId, ml_per_sec: f32) -> Result<()> {
        validate_flow_rate(ml_per_sec)?;
        self.mutate(id, |p| {
            info!(
                "PumpRegistry: pump {} flow {:.3} -> {:.3} ml/s",
                p.id, p.flow_rate_ml_per_sec, ml_per_sec
            );
            p.flow_rate_ml_per_sec = ml_per_sec;
        })
    }

    /// Enable or disable a pump. Enabling re-checks pin and ingredient
    /// uniqueness against the other enabled pumps.
    pub fn set_enabled(&self, id: PumpId, enabled: bool) -> Result<()> {
        {
            let mut pumps = self.write();
            let idx = pumps
                .iter()
                .position(|p| p.id == id)
                .ok_or(Error::PumpNotFound(id))?;
            let mut candidate = pumps.clone();
            candidate[idx].enabled = enabled;
            validate_pumps(&candidate)?;
            pumps[idx].enabled = enabled;
            info!("PumpRegistry: pump {} enabled={}", id, enabled);
        }
        self.persist();
        Ok(())
    }

    /// Replace the whole table. Rejected as a unit if any entry is invalid.
    pub fn replace_all(&self, pumps: Vec<PumpConfig>) -> Result<()> {
        validate_pumps(&pumps)?;
        info!("PumpRegistry: replacing table ({} pumps)", pumps.len());
        *self.write() = pumps;
        self.persist();
        Ok(())
    }

    /// Retry a previously failed write. Returns `true` if nothing is
    /// left unsaved.
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

    fn mutate(&self, id: PumpId, f: impl FnOnce(&mut PumpConfig)) -> Result<()> {
        {
            let mut pumps = self.write();
            let pump = pumps
                .iter_mut()
                .find(|p| p.id == id)
                .ok_or(Error::PumpNotFound(id))?;
            f(pump);
        }
        self.persist();
        Ok(())
    }

    fn persist(&self) -> bool {
        let snapshot = self.read().clone();
        match self.store.save_pumps(&snapshot) {
            Ok(()) => {
                self.dirty.store(false, Ordering::Release);
                true
            }
            Err(e) => {
                warn!("PumpRegistry: {}", Error::from(e));
                self.dirty.store(true, Ordering::Release);
                false
            }
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<PumpConfig>> {
        self.pumps.read().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<PumpConfig>> {
        self.pumps.write().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

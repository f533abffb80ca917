//! Fuzz target: recipe JSON into `build_plan`
//!
//! Any recipe that deserializes must either plan cleanly or fail with a
//! typed error; a plan never schedules an actuation outside the
//! configured duration limits.
//!
//! cargo fuzz run fuzz_recipe_plan

#![no_main]

use std::sync::Arc;

use dispenser::app::ports::{StoreError, StorePort};
use dispenser::config::DispenserConfig;
use dispenser::dispense::plan::build_plan;
use dispenser::ledger::IngredientLevel;
use dispenser::recipe::Recipe;
use dispenser::registry::{PumpConfig, PumpRegistry, default_pumps};
use libfuzzer_sys::fuzz_target;

struct NullStore;

impl StorePort for NullStore {
    fn load_pumps(&self) -> Result<Option<Vec<PumpConfig>>, StoreError> {
        Ok(None)
    }
    fn save_pumps(&self, _: &[PumpConfig]) -> Result<(), StoreError> {
        Ok(())
    }
    fn load_levels(&self) -> Result<Vec<IngredientLevel>, StoreError> {
        Ok(Vec::new())
    }
    fn save_levels(&self, _: &[IngredientLevel]) -> Result<(), StoreError> {
        Ok(())
    }
}

fuzz_target!(|data: &[u8]| {
    if data.len() < 4 {
        return;
    }
    let size_ml = f32::from_le_bytes([data[0], data[1], data[2], data[3]]);
    let Ok(recipe) = serde_json::from_slice::<Recipe>(&data[4..]) else {
        return;
    };

    let Ok(registry) = PumpRegistry::new(default_pumps(), Arc::new(NullStore)) else {
        return;
    };
    let cfg = DispenserConfig::default();
    let Ok(plan) = build_plan(&recipe, size_ml, &registry, &cfg) else {
        return;
    };
    for act in plan.actuations() {
        assert!(act.duration_ms >= cfg.min_actuation_ms);
        assert!(act.duration_ms <= cfg.max_actuation_ms);
        assert!(act.volume_ml > 0.0);
    }
});

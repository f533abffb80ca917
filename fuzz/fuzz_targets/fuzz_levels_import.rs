//! Fuzz target: levels backup import
//!
//! Feeds arbitrary bytes through `parse_levels` and, when they parse,
//! into `IngredientLedger::replace_all`. Whatever is accepted must leave
//! every row inside `0 ..= capacity`.
//!
//! cargo fuzz run fuzz_levels_import

#![no_main]

use std::sync::Arc;

use dispenser::adapters::json_store::parse_levels;
use dispenser::app::ports::{StoreError, StorePort};
use dispenser::ledger::{IngredientLedger, IngredientLevel};
use dispenser::registry::PumpConfig;
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
    let Ok(json) = std::str::from_utf8(data) else {
        return;
    };
    let Ok(levels) = parse_levels(json) else {
        return;
    };

    let ledger = IngredientLedger::new(Vec::new(), 1000.0, Arc::new(NullStore));
    if ledger.replace_all(levels).is_err() {
        return;
    }
    for level in ledger.snapshot() {
        assert!(level.capacity_ml > 0.0, "accepted a non-positive capacity");
        assert!(level.current_amount_ml >= 0.0);
        assert!(level.current_amount_ml <= level.capacity_ml);
    }
});

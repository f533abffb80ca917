//! Dispenser core library.
//!
//! Pump registry, ingredient ledger, availability evaluation, the
//! dispense orchestrator and calibration, behind port traits so the whole
//! core runs against mock adapters in tests and a relay bank on the rig.

#![deny(unused_must_use)]

pub mod adapters;
pub mod app;
pub mod autosave;
pub mod availability;
pub mod calibration;
pub mod config;
pub mod dispense;
pub mod error;
pub mod gate;
pub mod ledger;
pub mod recipe;
pub mod registry;

pub use error::{Error, Result};

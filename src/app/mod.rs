//! Application core: domain wiring behind port traits.
//!
//! This module holds the boundary of the dispenser core: the command and
//! response types an API layer speaks, the events the core emits, and the
//! **port traits** in [`ports`] through which every pump, file and log
//! line is reached. Everything here is testable without real hardware.

pub mod commands;
pub mod events;
pub mod ports;
pub mod service;

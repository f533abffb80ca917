//! Rig admission gate.
//!
//! The rig has one set of pumps, so at most one operation may drive it at a
//! time: a dispense job, a calibrate/vent/clean run, or an edit of the pump
//! table. The gate is
//! try-acquire only; a second request fails fast with [`Error::Busy`]
//! naming the current holder instead of queueing behind a physical
//! appliance.
//!
//! ```text
//!  dispense ───┐
//!  calibrate ──┤
//!  vent/clean ─┼──▶ RigGate::try_acquire ──▶ GateGuard (released on drop)
//!  pump edits ─┘            │
//!                           └──▶ Err(Busy { holder })
//! ```

use core::cell::Cell;
use core::fmt;

use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use log::debug;

use crate::error::{Error, Result};
use crate::registry::PumpId;

/// What currently holds the rig.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RigOperation {
    Dispense,
    Calibrate(PumpId),
    Vent(PumpId),
    Clean(PumpId),
    /// Flow rate, enable flag or whole-table edit.
    Reconfigure,
}

impl fmt::Display for RigOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dispense => write!(f, "dispense"),
            Self::Calibrate(p) => write!(f, "calibration of pump {p}"),
            Self::Vent(p) => write!(f, "venting of pump {p}"),
            Self::Clean(p) => write!(f, "cleaning of pump {p}"),
            Self::Reconfigure => write!(f, "pump reconfiguration"),
        }
    }
}

/// Process-wide single-operation gate.
pub struct RigGate {
    holder: Mutex<CriticalSectionRawMutex, Cell<Option<RigOperation>>>,
}

impl Default for RigGate {
    fn default() -> Self {
        Self::new()
    }
}

impl RigGate {
    pub const fn new() -> Self {
        Self {
            holder: Mutex::new(Cell::new(None)),
        }
    }

    /// Claim the rig for `op`, or fail with `Busy` if it is held.
    pub fn try_acquire(&self, op: RigOperation) -> Result<GateGuard<'_>> {
        self.holder.lock(|h| match h.get() {
            Some(current) => Err(Error::Busy {
                holder: current.to_string(),
            }),
            None => {
                h.set(Some(op));
                debug!("RigGate: acquired for {}", op);
                Ok(GateGuard { gate: self })
            }
        })
    }

    /// Current holder, if any.
    pub fn holder(&self) -> Option<RigOperation> {
        self.holder.lock(Cell::get)
    }

    fn release(&self) {
        let prev = self.holder.lock(|h| h.replace(None));
        if let Some(op) = prev {
            debug!("RigGate: released by {}", op);
        }
    }
}

/// Held for the duration of one rig operation.
#[must_use = "the rig is released as soon as the guard is dropped"]
pub struct GateGuard<'a> {
    gate: &'a RigGate,
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}

//! Log-based event sink adapter.
//!
//! Implements [`EventSink`] by writing each [`DispenseEvent`] as a one-line
//! record through the `log` facade. A websocket or display adapter would
//! implement the same trait.

use log::{info, warn};

use crate::app::events::DispenseEvent;
use crate::app::ports::EventSink;

/// Adapter that logs every [`DispenseEvent`].
#[derive(Default)]
pub struct LogEventSink;

impl LogEventSink {
    pub fn new() -> Self {
        Self
    }
}

impl EventSink for LogEventSink {
    fn emit(&self, event: &DispenseEvent) {
        match event {
            DispenseEvent::JobStateChanged { from, to } => {
                info!("JOB   | {} -> {}", from, to);
            }
            DispenseEvent::ActuationStarted {
                pump,
                ingredient,
                volume_ml,
                duration_ms,
            } => {
                info!(
                    "PUMP  | #{} {} on | {:.1} ml in {} ms",
                    pump, ingredient, volume_ml, duration_ms
                );
            }
            DispenseEvent::ActuationCommitted {
                pump,
                ingredient,
                dispensed_ml,
                remaining_ml,
            } => {
                info!(
                    "POUR  | #{} {} | {:.1} ml | {:.1} ml left",
                    pump, ingredient, dispensed_ml, remaining_ml
                );
            }
            DispenseEvent::ActuationFailed {
                pump,
                ingredient,
                reason,
            } => {
                warn!("FAULT | #{} {} | {}", pump, ingredient, reason);
            }
            DispenseEvent::StockExhausted {
                ingredient,
                requested_ml,
                available_ml,
            } => {
                warn!(
                    "STOCK | {} exhausted | need {:.1} ml, have {:.1} ml",
                    ingredient, requested_ml, available_ml
                );
            }
            DispenseEvent::ManualStepPending {
                ingredient,
                instruction,
            } => {
                info!(
                    "WAIT  | {} | {}",
                    ingredient,
                    instruction.as_deref().unwrap_or("manual step")
                );
            }
            DispenseEvent::ManualStepAcknowledged { ingredient } => {
                info!("WAIT  | {} acknowledged", ingredient);
            }
            DispenseEvent::StockLow {
                ingredient,
                remaining_ml,
                capacity_ml,
            } => {
                warn!(
                    "STOCK | {} low | {:.0}/{:.0} ml",
                    ingredient, remaining_ml, capacity_ml
                );
            }
            DispenseEvent::MaintenanceFinished {
                operation,
                duration_ms,
                ok,
            } => {
                info!(
                    "MAINT | {} | {} ms | {}",
                    operation,
                    duration_ms,
                    if *ok { "ok" } else { "failed" }
                );
            }
        }
    }
}

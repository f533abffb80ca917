//! Port traits: the hexagonal boundary between domain logic and the outside world.
//!
//! ```text
//!   Adapter ──▶ Port trait ──▶ Orchestrator / Ledger / Registry (domain)
//! ```
//!
//! Driven adapters (pump relays, persistent store, event sinks) implement
//! these traits. The domain consumes them via generics or trait objects and
//! never touches hardware or files directly.

use crate::ledger::IngredientLevel;
use crate::registry::{PumpConfig, PumpId};

use super::events::DispenseEvent;

// ───────────────────────────────────────────────────────────────
// Actuator port (driven adapter: domain → pump relays)
// ───────────────────────────────────────────────────────────────

/// Result reported by the driver once an activation has ended.
#[derive(Debug, Clone, PartialEq)]
pub enum ActuationOutcome {
    /// The pump ran and was switched off. `actual_volume_ml` is `None`
    /// when the driver cannot measure what it delivered.
    Completed { actual_volume_ml: Option<f32> },
    /// The driver reported a hardware fault for this pump.
    Failed { reason: heapless::String<64> },
}

impl ActuationOutcome {
    /// A completed activation with no volume feedback.
    pub const fn completed() -> Self {
        Self::Completed {
            actual_volume_ml: None,
        }
    }

    /// Build a failure, truncating `reason` to the fixed buffer.
    pub fn failed(reason: &str) -> Self {
        let mut buf = heapless::String::new();
        for c in reason.chars() {
            if buf.push(c).is_err() {
                break;
            }
        }
        Self::Failed { reason: buf }
    }
}

/// Write-side port: the domain calls this to run pumps.
///
/// # Safety contract
///
/// Implementations MUST enforce their own hard cutoff at `duration_ms` (or
/// a safety maximum), and MUST switch the pump off if the activation
/// future is dropped before it resolves. A stalled or crashed caller must
/// never leave a pump running.
#[allow(async_fn_in_trait)]
pub trait ActuatorPort {
    /// Run `pump` for `duration_ms` and resolve once it is switched off.
    async fn activate(&self, pump: &PumpConfig, duration_ms: u32) -> ActuationOutcome;

    /// Request immediate switch-off of one pump. The pending
    /// [`activate`](Self::activate) future for it resolves soon after.
    fn deactivate(&self, pump: PumpId);

    /// Switch every pump off (shutdown path).
    fn all_off(&self);
}

// ───────────────────────────────────────────────────────────────
// Store port (driven adapter: domain ↔ persistent storage)
// ───────────────────────────────────────────────────────────────

/// Loads and persists pump configuration and ingredient levels.
///
/// The domain calls `save_*` after every mutation. Failures are logged and
/// retried by the autosave task; they never roll back in-memory state.
/// Writes SHOULD be atomic: no partially written file on power loss.
pub trait StorePort: Send + Sync {
    /// Load the pump table. `Ok(None)` means nothing is stored yet.
    fn load_pumps(&self) -> Result<Option<Vec<PumpConfig>>, StoreError>;

    /// Persist the full pump table.
    fn save_pumps(&self, pumps: &[PumpConfig]) -> Result<(), StoreError>;

    /// Load every ingredient level. Empty when nothing is stored.
    fn load_levels(&self) -> Result<Vec<IngredientLevel>, StoreError>;

    /// Persist every ingredient level.
    fn save_levels(&self, levels: &[IngredientLevel]) -> Result<(), StoreError>;
}

// ───────────────────────────────────────────────────────────────
// Event sink port (driven adapter: domain → logging / telemetry)
// ───────────────────────────────────────────────────────────────

/// The domain emits structured [`DispenseEvent`]s through this port.
/// Adapters decide where they go (log, websocket, display).
pub trait EventSink {
    fn emit(&self, event: &DispenseEvent);
}

/// Sink that drops every event.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit(&self, _event: &DispenseEvent) {}
}

// ───────────────────────────────────────────────────────────────
// Error types
// ───────────────────────────────────────────────────────────────

/// Errors from [`StorePort`] operations.
#[derive(Debug)]
pub enum StoreError {
    /// Stored data failed to deserialize.
    Corrupted(String),
    /// Generic I/O error from the storage backend.
    Io(String),
    /// Backend is not reachable right now.
    Unavailable,
}

impl core::fmt::Display for StoreError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Corrupted(msg) => write!(f, "stored data corrupted: {}", msg),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
            Self::Unavailable => write!(f, "store unavailable"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<StoreError> for crate::error::Error {
    fn from(e: StoreError) -> Self {
        Self::PersistenceUnavailable(e.to_string())
    }
}

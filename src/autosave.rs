//! Periodic flush of dirty state.
//!
//! Registry and ledger write through on every mutation. When the store is
//! down they stay authoritative in memory and mark themselves dirty; this
//! task retries on a fixed interval and once more at shutdown.
//!
//! ```text
//!  autosave thread
//!  ┌──────────────────────────────────────────────────┐
//!  │ loop:                                            │
//!  │   or(Timer::after(interval), STOP.wait())        │
//!  │     tick ──▶ flush registry + ledger if dirty    │
//!  │     stop ──▶ final flush ──▶ DONE.signal()       │
//!  └──────────────────────────────────────────────────┘
//!  shutdown(): STOP.signal(); or(DONE.wait(), Timer(timeout))
//! ```

use core::time::Duration;
use std::sync::Arc;
use std::thread::JoinHandle;

use async_io_mini::Timer;
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use futures_lite::future::{block_on, or};
use log::{debug, info, warn};

use crate::ledger::IngredientLedger;
use crate::registry::PumpRegistry;

/// Flush whatever is dirty. Returns `true` when nothing is left dirty.
pub fn flush_dirty(registry: &PumpRegistry, ledger: &IngredientLedger) -> bool {
    let mut clean = true;
    if registry.is_dirty() {
        clean &= registry.flush();
    }
    if ledger.is_dirty() {
        clean &= ledger.flush();
    }
    clean
}

struct Signals {
    stop: Signal<CriticalSectionRawMutex, ()>,
    done: Signal<CriticalSectionRawMutex, bool>,
}

impl Signals {
    const fn new() -> Self {
        Self {
            stop: Signal::new(),
            done: Signal::new(),
        }
    }
}

enum Wake {
    Tick,
    Stop,
}

/// Handle to the running autosave thread.
pub struct Autosave {
    signals: Arc<Signals>,
    handle: Option<JoinHandle<()>>,
    shutdown_timeout: Duration,
}

impl Autosave {
    pub fn spawn(
        registry: Arc<PumpRegistry>,
        ledger: Arc<IngredientLedger>,
        interval: Duration,
        shutdown_timeout: Duration,
    ) -> std::io::Result<Self> {
        let signals = Arc::new(Signals::new());
        let thread_signals = signals.clone();
        let handle = std::thread::Builder::new()
            .name("autosave".into())
            .spawn(move || run(&registry, &ledger, interval, &thread_signals))?;
        info!("Autosave started (every {}s)", interval.as_secs());
        Ok(Self {
            signals,
            handle: Some(handle),
            shutdown_timeout,
        })
    }

    /// Stop the thread after a final flush. Returns `true` if the flush
    /// finished clean within the timeout.
    pub fn shutdown(mut self) -> bool {
        self.signals.stop.signal(());
        let done = block_on(or(
            async { Some(self.signals.done.wait().await) },
            async {
                Timer::after(self.shutdown_timeout).await;
                None
            },
        ));
        match done {
            Some(true) => {
                info!("Autosave: final flush complete");
                if let Some(h) = self.handle.take() {
                    let _ = h.join();
                }
                true
            }
            Some(false) => {
                warn!("Autosave: final flush left dirty state (store unavailable)");
                if let Some(h) = self.handle.take() {
                    let _ = h.join();
                }
                false
            }
            None => {
                // Thread left detached; it exits on its own once the store returns.
                warn!(
                    "Autosave: final flush timed out after {} ms",
                    self.shutdown_timeout.as_millis()
                );
                false
            }
        }
    }
}

fn run(registry: &PumpRegistry, ledger: &IngredientLedger, interval: Duration, signals: &Signals) {
    loop {
        let wake = block_on(or(
            async {
                Timer::after(interval).await;
                Wake::Tick
            },
            async {
                signals.stop.wait().await;
                Wake::Stop
            },
        ));
        match wake {
            Wake::Tick => {
                if !flush_dirty(registry, ledger) {
                    debug!("Autosave: store still unavailable, retrying next tick");
                }
            }
            Wake::Stop => {
                let clean = flush_dirty(registry, ledger);
                signals.done.signal(clean);
                return;
            }
        }
    }
}

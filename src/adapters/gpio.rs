//! Relay-bank actuator.
//!
//! Implements [`ActuatorPort`] over one `embedded-hal` output pin per pump
//! relay. The relay boards on the rig are active-low: driving the pin LOW
//! energises the pump.
//!
//! ## Safety contract
//!
//! - Every activation is clamped to the watchdog maximum.
//! - A dedicated `relay-watchdog` thread switches each relay off at its
//!   deadline, whether or not the executor that awaits the activation is
//!   still being polled.
//! - The relay is also switched off on `deactivate`, on `all_off`, when the
//!   activation future is dropped early, and when the bank is dropped.
//!
//! ## Dual-target design
//!
//! On the rig: pins come from the board HAL.
//! On host/test: [`SimPin`] tracks relay state in memory only.

use core::convert::Infallible;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;
use std::time::Instant;

use async_io_mini::Timer;
use embedded_hal::digital::{ErrorType, OutputPin};
use futures_lite::future::or;
use log::{debug, info, warn};

use crate::app::ports::{ActuationOutcome, ActuatorPort};
use crate::registry::{PumpConfig, PumpId};

/// How often a running activation checks for an early stop.
const STOP_POLL_MS: u64 = 5;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Relay bank ────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
struct Energised {
    gpio: u8,
    deadline: Instant,
}

/// State shared between the bank and its watchdog thread.
struct Shared<P> {
    /// Relay pins keyed by GPIO number.
    relays: Mutex<BTreeMap<u8, P>>,
    /// Pumps currently energised. Lock order: `running`, then `relays`.
    running: Mutex<BTreeMap<PumpId, Energised>>,
    /// Pumps asked to stop early.
    stop_requests: Mutex<BTreeSet<PumpId>>,
    /// Signalled whenever `running` gains an entry or the bank shuts down.
    wake: Condvar,
    shutdown: AtomicBool,
    active_low: AtomicBool,
}

impl<P: OutputPin> Shared<P> {
    fn gpios(&self) -> Vec<u8> {
        lock(&self.relays).keys().copied().collect()
    }

    /// Set relay `gpio` on or off. Returns `false` if the pin is unknown
    /// or the write failed.
    fn drive(&self, gpio: u8, on: bool) -> bool {
        let mut relays = lock(&self.relays);
        let Some(pin) = relays.get_mut(&gpio) else {
            return false;
        };
        let low = on == self.active_low.load(Ordering::Relaxed);
        let res = if low { pin.set_low() } else { pin.set_high() };
        if res.is_err() {
            warn!("RelayBank: write to GPIO {} failed", gpio);
            return false;
        }
        true
    }

    fn all_relays_off(&self) {
        for gpio in self.gpios() {
            self.drive(gpio, false);
        }
    }

    fn stop_requested(&self, pump: PumpId) -> bool {
        lock(&self.stop_requests).contains(&pump)
    }

    /// Watchdog loop: cut every relay whose deadline has passed, then
    /// sleep until the next deadline or until woken.
    fn watch(&self) {
        let mut running = lock(&self.running);
        while !self.shutdown.load(Ordering::Acquire) {
            let now = Instant::now();
            let expired: Vec<PumpId> = running
                .iter()
                .filter(|(_, e)| e.deadline <= now)
                .map(|(pump, _)| *pump)
                .collect();
            for pump in expired {
                if let Some(e) = running.remove(&pump) {
                    self.drive(e.gpio, false);
                    debug!("RelayBank: watchdog cut pump {} (GPIO {})", pump, e.gpio);
                }
            }

            running = match running.values().map(|e| e.deadline).min() {
                Some(next) => {
                    let wait = next.saturating_duration_since(Instant::now());
                    match self.wake.wait_timeout(running, wait) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => self
                    .wake
                    .wait(running)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
    }
}

pub struct RelayBank<P: OutputPin> {
    shared: Arc<Shared<P>>,
    watchdog: Option<JoinHandle<()>>,
    max_actuation_ms: u32,
}

impl<P: OutputPin + Send + 'static> RelayBank<P> {
    /// Build a bank from `(gpio, pin)` pairs and start its watchdog
    /// thread. All relays start off.
    pub fn new(
        pins: impl IntoIterator<Item = (u8, P)>,
        max_actuation_ms: u32,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            relays: Mutex::new(pins.into_iter().collect()),
            running: Mutex::new(BTreeMap::new()),
            stop_requests: Mutex::new(BTreeSet::new()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
            active_low: AtomicBool::new(true),
        });
        shared.all_relays_off();

        let watched = shared.clone();
        let watchdog = std::thread::Builder::new()
            .name("relay-watchdog".into())
            .spawn(move || watched.watch())?;
        info!(
            "RelayBank: {} relays, watchdog max {} ms",
            shared.gpios().len(),
            max_actuation_ms
        );

        Ok(Self {
            shared,
            watchdog: Some(watchdog),
            max_actuation_ms,
        })
    }
}

impl<P: OutputPin> RelayBank<P> {
    /// For relay boards that switch on a HIGH level.
    #[must_use]
    pub fn active_high(self) -> Self {
        self.shared.active_low.store(false, Ordering::Relaxed);
        self.shared.all_relays_off();
        self
    }

    async fn wait_stop(&self, pump: PumpId) {
        while !self.shared.stop_requested(pump) {
            Timer::after(Duration::from_millis(STOP_POLL_MS)).await;
        }
    }
}

impl<P: OutputPin> Drop for RelayBank<P> {
    fn drop(&mut self) {
        {
            let _running = lock(&self.shared.running);
            self.shared.shutdown.store(true, Ordering::Release);
        }
        self.shared.wake.notify_all();
        if let Some(handle) = self.watchdog.take() {
            if handle.join().is_err() {
                warn!("RelayBank: watchdog thread panicked");
            }
        }
        self.shared.all_relays_off();
    }
}

/// Switches the relay off when dropped.
struct RelayOn<'a, P: OutputPin> {
    shared: &'a Shared<P>,
    pump: PumpId,
    gpio: u8,
}

impl<P: OutputPin> Drop for RelayOn<'_, P> {
    fn drop(&mut self) {
        lock(&self.shared.running).remove(&self.pump);
        self.shared.drive(self.gpio, false);
        debug!("RelayBank: pump {} off (GPIO {})", self.pump, self.gpio);
    }
}

impl<P: OutputPin> ActuatorPort for RelayBank<P> {
    async fn activate(&self, pump: &PumpConfig, duration_ms: u32) -> ActuationOutcome {
        let ms = if duration_ms > self.max_actuation_ms {
            warn!(
                "RelayBank: pump {} asked for {} ms, clamped to {} ms",
                pump.id, duration_ms, self.max_actuation_ms
            );
            self.max_actuation_ms
        } else {
            duration_ms
        };
        let run_for = Duration::from_millis(u64::from(ms));

        lock(&self.shared.stop_requests).remove(&pump.id);
        {
            let mut running = lock(&self.shared.running);
            if !self.shared.drive(pump.pin, true) {
                return ActuationOutcome::failed("relay pin unavailable");
            }
            running.insert(
                pump.id,
                Energised {
                    gpio: pump.pin,
                    deadline: Instant::now() + run_for,
                },
            );
        }
        self.shared.wake.notify_all();
        let _on = RelayOn {
            shared: &self.shared,
            pump: pump.id,
            gpio: pump.pin,
        };
        debug!("RelayBank: pump {} on (GPIO {}) for {} ms", pump.id, pump.pin, ms);

        let stopped = or(
            async {
                Timer::after(run_for).await;
                false
            },
            async {
                self.wait_stop(pump.id).await;
                true
            },
        )
        .await;

        if stopped {
            ActuationOutcome::failed("stopped early")
        } else {
            ActuationOutcome::completed()
        }
    }

    fn deactivate(&self, pump: PumpId) {
        lock(&self.shared.stop_requests).insert(pump);
        let gpio = lock(&self.shared.running).get(&pump).map(|e| e.gpio);
        if let Some(gpio) = gpio {
            self.shared.drive(gpio, false);
        }
    }

    fn all_off(&self) {
        let running: Vec<PumpId> = lock(&self.shared.running).keys().copied().collect();
        lock(&self.shared.stop_requests).extend(running);
        self.shared.all_relays_off();
    }
}

// ── Host simulation pin ───────────────────────────────────────

/// In-memory output pin. Clones share state, so a test can keep one
/// handle and hand the other to the bank.
#[derive(Debug, Clone, Default)]
pub struct SimPin {
    high: Arc<AtomicBool>,
}

impl SimPin {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_high(&self) -> bool {
        self.high.load(Ordering::SeqCst)
    }
}

impl ErrorType for SimPin {
    type Error = Infallible;
}

impl OutputPin for SimPin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        self.high.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.high.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Simulated bank with one relay per pump in `pumps`.
pub fn sim_bank(pumps: &[PumpConfig], max_actuation_ms: u32) -> std::io::Result<RelayBank<SimPin>> {
    RelayBank::new(pumps.iter().map(|p| (p.pin, SimPin::new())), max_actuation_ms)
}

//! Job state machine.
//!
//! ```text
//!  PENDING ──▶ PLANNING ──▶ DISPENSING ──▶ COMPLETED
//!                  │             │    └──▶ PARTIALLY_COMPLETED
//!                  │             │    └──▶ FAILED
//!                  └──▶ FAILED   │
//!                                └──[abort]──▶ ABORTING ──▶ ABORTED
//! ```
//!
//! The table in [`JobState::can_transition_to`] is the single source of
//! truth. [`JobControl`] is the cross-thread handle through which
//! `abort()` and `resume()` reach a running job.

use core::fmt;
use core::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::signal::Signal;
use log::{error, info};
use serde::Serialize;

use crate::app::events::DispenseEvent;
use crate::app::ports::EventSink;
use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// State identity
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum JobState {
    Pending,
    Planning,
    Dispensing,
    Completed,
    PartiallyCompleted,
    Failed,
    Aborting,
    Aborted,
}

impl JobState {
    /// Legal transitions. Anything not listed here is a bug.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::{
            Aborted, Aborting, Completed, Dispensing, Failed, PartiallyCompleted, Pending, Planning,
        };
        matches!(
            (self, next),
            (Pending, Planning)
                | (Planning, Dispensing | Failed)
                | (Dispensing, Completed | PartiallyCompleted | Failed | Aborting)
                | (Aborting, Aborted)
        )
    }

    /// No further transitions possible.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::PartiallyCompleted | Self::Failed | Self::Aborted
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Pending => "Pending",
            Self::Planning => "Planning",
            Self::Dispensing => "Dispensing",
            Self::Completed => "Completed",
            Self::PartiallyCompleted => "PartiallyCompleted",
            Self::Failed => "Failed",
            Self::Aborting => "Aborting",
            Self::Aborted => "Aborted",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Job control (shared between the job thread and callers)
// ---------------------------------------------------------------------------

/// Live status of a running job.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    pub state: JobState,
    /// Set while the job waits for the operator.
    pub pending_manual: Option<PendingManual>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingManual {
    pub ingredient: String,
    pub instruction: Option<String>,
}

struct Inner {
    state: JobState,
    pending_manual: Option<PendingManual>,
}

/// Control block of one job.
pub struct JobControl {
    inner: Mutex<Inner>,
    abort: AtomicBool,
    resume: Signal<CriticalSectionRawMutex, ()>,
}

impl Default for JobControl {
    fn default() -> Self {
        Self::new()
    }
}

impl JobControl {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: JobState::Pending,
                pending_manual: None,
            }),
            abort: AtomicBool::new(false),
            resume: Signal::new(),
        }
    }

    pub fn state(&self) -> JobState {
        self.lock().state
    }

    pub fn status(&self) -> JobStatus {
        let inner = self.lock();
        JobStatus {
            state: inner.state,
            pending_manual: inner.pending_manual.clone(),
        }
    }

    /// Move to `next` if the table allows it; emits `JobStateChanged`.
    /// Illegal requests are logged and ignored.
    pub fn transition(&self, next: JobState, sink: &dyn EventSink) -> bool {
        let from = {
            let mut inner = self.lock();
            let from = inner.state;
            if !from.can_transition_to(next) {
                error!("Job transition rejected: {} -> {}", from, next);
                return false;
            }
            inner.state = next;
            if next != JobState::Dispensing {
                inner.pending_manual = None;
            }
            from
        };
        info!("Job transition: {} -> {}", from, next);
        sink.emit(&DispenseEvent::JobStateChanged { from, to: next });
        true
    }

    /// Request cancellation. Accepted only while dispensing.
    pub fn request_abort(&self) -> Result<()> {
        let state = self.state();
        if state != JobState::Dispensing {
            return Err(Error::InvalidState {
                action: "abort",
                state: state.to_string(),
            });
        }
        info!("Job: abort requested");
        self.abort.store(true, Ordering::Release);
        // Wake a job parked on a manual step so it can observe the abort.
        self.resume.signal(());
        Ok(())
    }

    pub fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::Acquire)
    }

    /// Acknowledge the pending manual step.
    pub fn request_resume(&self) -> Result<()> {
        let inner = self.lock();
        if inner.state != JobState::Dispensing || inner.pending_manual.is_none() {
            return Err(Error::InvalidState {
                action: "resume",
                state: if inner.state == JobState::Dispensing {
                    "dispensing without a pending manual step".to_string()
                } else {
                    inner.state.to_string()
                },
            });
        }
        drop(inner);
        self.resume.signal(());
        Ok(())
    }

    pub(crate) fn set_pending_manual(&self, pending: Option<PendingManual>) {
        if pending.is_some() {
            // Drop acknowledgements that arrived before this pause.
            self.resume.reset();
        }
        self.lock().pending_manual = pending;
    }

    /// Resolves on the next `request_resume` (or abort).
    pub(crate) async fn wait_resume(&self) {
        self.resume.wait().await;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

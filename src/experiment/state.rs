//! Acquisition status shared between the engine and its controllers.
//!
//! The engine is the only writer of the lifecycle state. Controllers (a UI,
//! the CLI's signal handler) only ever touch the pause flag.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU8, Ordering};

/// Acquisition lifecycle state.
///
/// # State Machine
///
/// ```text
/// PreInit ──> Setup ──> Moving ──> Acquiring ──> Teardown ──> Done
///                         ▲  │        │  ▲
///                         │  ▼        ▼  │
///                        Waiting / Paused
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum AcqState {
    /// Parameters built, run not started
    PreInit = 0,
    /// Validating parameters and preparing devices
    Setup = 1,
    /// Driving axes to a row or slice position
    Moving = 2,
    /// Capturing frames
    Acquiring = 3,
    /// Sleeping until the next timepoint
    Waiting = 4,
    /// Held by the pause flag
    Paused = 5,
    /// Restoring devices and finalizing output
    Teardown = 6,
    /// Finished; output handler finalized
    Done = 7,
}

impl AcqState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => AcqState::PreInit,
            1 => AcqState::Setup,
            2 => AcqState::Moving,
            3 => AcqState::Acquiring,
            4 => AcqState::Waiting,
            5 => AcqState::Paused,
            6 => AcqState::Teardown,
            _ => AcqState::Done,
        }
    }

    /// Check if the state allows pausing.
    pub fn can_pause(&self) -> bool {
        matches!(
            self,
            AcqState::Moving | AcqState::Acquiring | AcqState::Waiting
        )
    }

    /// Check if the run is over.
    pub fn is_terminal(&self) -> bool {
        matches!(self, AcqState::Done)
    }
}

impl std::fmt::Display for AcqState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AcqState::PreInit => write!(f, "PreInit"),
            AcqState::Setup => write!(f, "Setup"),
            AcqState::Moving => write!(f, "Moving"),
            AcqState::Acquiring => write!(f, "Acquiring"),
            AcqState::Waiting => write!(f, "Waiting"),
            AcqState::Paused => write!(f, "Paused"),
            AcqState::Teardown => write!(f, "Teardown"),
            AcqState::Done => write!(f, "Done"),
        }
    }
}

const NO_WAKE: i64 = i64::MIN;

/// Thread-safe status token for one run.
///
/// Shared by `Arc` between the engine and anything that wants to observe or
/// pause it. [`state`](Self::state) never reports [`AcqState::Paused`] while
/// the pause flag is clear.
#[derive(Debug)]
pub struct AcqStatus {
    state: AtomicU8,
    resume_state: AtomicU8,
    pause_requested: AtomicBool,
    wakes_at_ms: AtomicI64,
}

impl Default for AcqStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl AcqStatus {
    /// A fresh status in [`AcqState::PreInit`].
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(AcqState::PreInit as u8),
            resume_state: AtomicU8::new(AcqState::PreInit as u8),
            pause_requested: AtomicBool::new(false),
            wakes_at_ms: AtomicI64::new(NO_WAKE),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> AcqState {
        let state = AcqState::from_u8(self.state.load(Ordering::SeqCst));
        if state == AcqState::Paused && !self.pause_requested.load(Ordering::SeqCst) {
            return AcqState::from_u8(self.resume_state.load(Ordering::SeqCst));
        }
        state
    }

    /// Request that the engine pause at its next suspension point.
    pub fn pause(&self) {
        self.pause_requested.store(true, Ordering::SeqCst);
    }

    /// Clear a pause request.
    pub fn resume(&self) {
        self.pause_requested.store(false, Ordering::SeqCst);
    }

    /// Set or clear the pause request.
    pub fn set_paused(&self, paused: bool) {
        self.pause_requested.store(paused, Ordering::SeqCst);
    }

    /// Whether a pause is requested.
    pub fn is_paused(&self) -> bool {
        self.pause_requested.load(Ordering::SeqCst)
    }

    /// When the engine's current inter-timepoint wait ends.
    pub fn wakes_at(&self) -> Option<DateTime<Utc>> {
        match self.wakes_at_ms.load(Ordering::SeqCst) {
            NO_WAKE => None,
            ms => Utc.timestamp_millis_opt(ms).single(),
        }
    }

    pub(crate) fn set_state(&self, state: AcqState) {
        let previous = self.state.swap(state as u8, Ordering::SeqCst);
        if previous != state as u8 {
            tracing::trace!(from = %AcqState::from_u8(previous), to = %state, "Status transition");
        }
    }

    /// Enter [`AcqState::Paused`], remembering where to return to.
    pub(crate) fn enter_paused(&self) {
        let current = AcqState::from_u8(self.state.load(Ordering::SeqCst));
        if current != AcqState::Paused {
            self.resume_state.store(current as u8, Ordering::SeqCst);
        }
        self.set_state(AcqState::Paused);
    }

    /// Leave [`AcqState::Paused`] for the state held before it.
    pub(crate) fn leave_paused(&self) {
        if self.state.load(Ordering::SeqCst) == AcqState::Paused as u8 {
            self.set_state(AcqState::from_u8(self.resume_state.load(Ordering::SeqCst)));
        }
    }

    pub(crate) fn set_waiting_until(&self, wakes_at: DateTime<Utc>) {
        self.wakes_at_ms
            .store(wakes_at.timestamp_millis(), Ordering::SeqCst);
        self.set_state(AcqState::Waiting);
    }

    pub(crate) fn clear_wake(&self) {
        self.wakes_at_ms.store(NO_WAKE, Ordering::SeqCst);
    }
}

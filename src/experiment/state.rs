//! Sweep state machine and position tracking.

use crate::storage::archive::EntryKey;
use serde::{Deserialize, Serialize};

/// Sweep execution state.
///
/// # State Machine
///
/// ```text
/// Idle ──> Homing ──> Positioning ──> Capturing ──> Dispatching ─┐
///             │          ▲                                      │
///             │          └──────────── next pair ───────────────┤
///             │                                                 ▼
///             └───── abort / error ─────────────────────────> Returning
///                                                               │
///                                                           Draining
///                                                            │     │
///                                                          Done  Aborted
/// ```
///
/// Any of Homing, Positioning, Capturing and Dispatching may go straight to
/// Returning when the sweep is cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SweepState {
    /// Nothing started
    Idle,
    /// Initializing stages and moving to the first scan position
    Homing,
    /// Moving to the next position pair
    Positioning,
    /// Acquisition in progress
    Capturing,
    /// Handing the captured matrix to the archive writer
    Dispatching,
    /// Moving both stages back to their start positions
    Returning,
    /// Waiting for outstanding archive writes
    Draining,
    /// Every pair captured and the archive closed
    Done,
    /// Sweep cut short; the archive holds a consistent subset
    Aborted,
}

impl std::fmt::Display for SweepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SweepState::Idle => "Idle",
            SweepState::Homing => "Homing",
            SweepState::Positioning => "Positioning",
            SweepState::Capturing => "Capturing",
            SweepState::Dispatching => "Dispatching",
            SweepState::Returning => "Returning",
            SweepState::Draining => "Draining",
            SweepState::Done => "Done",
            SweepState::Aborted => "Aborted",
        };
        f.write_str(name)
    }
}

impl SweepState {
    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(&self, next: SweepState) -> bool {
        use SweepState::*;
        matches!(
            (self, next),
            (Idle, Homing)
                | (Homing, Positioning)
                | (Positioning, Capturing)
                | (Capturing, Dispatching)
                | (Dispatching, Positioning)
                | (Homing | Positioning | Capturing | Dispatching, Returning)
                | (Returning, Draining)
                | (Draining, Done | Aborted)
        )
    }
}

/// Where the sweep is in the position grid.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepPosition {
    current: Option<EntryKey>,
    captured: Vec<EntryKey>,
}

impl SweepPosition {
    /// No pair started yet.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start working on `key` (moving to it or capturing it).
    pub fn begin(&mut self, key: EntryKey) {
        self.current = Some(key);
    }

    /// `key` has been captured and handed off for archiving.
    pub fn complete(&mut self, key: EntryKey) {
        if self.current == Some(key) {
            self.current = None;
        }
        self.captured.push(key);
    }

    /// Pair being moved to or captured, if any.
    pub fn in_flight(&self) -> Option<EntryKey> {
        self.current
    }

    /// Pairs captured so far, in sweep order.
    pub fn captured(&self) -> &[EntryKey] {
        &self.captured
    }
}

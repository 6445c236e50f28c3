//! Production clock state.
//!
//! `time_elapsed` is a prefix-sum-relative clock: the time spent inside the
//! item under the cursor is `time_elapsed - rundown.prefix_sum(cursor)`.

use serde::{Deserialize, Serialize};

/// Positional pointer to the active item.
///
/// Cursors address items by position, not by id, so a structural edit can
/// leave a cursor pointing at a different item than before.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Cursor {
    pub folder_index: usize,
    pub item_index: usize,
}

impl Cursor {
    /// The (0,0) cursor. Also the reset position of a stopped clock.
    pub const ORIGIN: Cursor = Cursor {
        folder_index: 0,
        item_index: 0,
    };

    pub fn new(folder_index: usize, item_index: usize) -> Self {
        Self {
            folder_index,
            item_index,
        }
    }

    pub fn is_origin(&self) -> bool {
        *self == Self::ORIGIN
    }
}

impl std::fmt::Display for Cursor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.folder_index, self.item_index)
    }
}

/// Phase of the timer state machine, derived from [`TimerState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimerPhase {
    /// Not running, cursor at origin, no time elapsed.
    Stopped,
    Running,
    /// Not running, time frozen at its current value.
    Paused,
}

/// Shared clock state converged across every client in a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TimerState {
    pub is_running: bool,
    /// Seconds since the start of the rundown.
    pub time_elapsed: u64,
    pub cursor: Cursor,
}

impl TimerState {
    /// The STOPPED state: cursor (0,0), time 0, not running.
    pub fn stopped() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> TimerPhase {
        if self.is_running {
            TimerPhase::Running
        } else if self.time_elapsed == 0 && self.cursor.is_origin() {
            TimerPhase::Stopped
        } else {
            TimerPhase::Paused
        }
    }

    /// Whether this state is the explicit reset signal (origin, time 0).
    pub fn is_reset(&self) -> bool {
        self.cursor.is_origin() && self.time_elapsed == 0
    }
}

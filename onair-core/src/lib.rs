//! # onair-core: rundown document model and production clock state
//!
//! A [`Rundown`] is an ordered tree of [`Folder`]s holding [`Item`]s. The
//! running clock is a [`TimerState`] whose `time_elapsed` is measured from
//! the start of the rundown, so the time spent inside the current item is
//! derived with [`Rundown::prefix_sum`].
//!
//! ```text
//! Rundown
//!  ├── Folder "Opening"   ┌ prefix_sum(0,1) = 60
//!  │    ├── Item 60s  ────┘
//!  │    └── Item 30s  ◄── cursor (0,1)
//!  └── Folder "Block 2"
//!       └── Item 120s
//! ```

pub mod rundown;
pub mod timer;

pub use rundown::{
    normalize_status, Folder, Item, Presentation, Rundown, RundownError, RundownSummary,
    ScriptFields, STATUS_LIVE, STATUS_NEW,
};
pub use timer::{Cursor, TimerPhase, TimerState};

//! Periodic unconditional re-broadcast of the running clock.
//!
//! Only the engine that started the clock beats. Lost or reordered timer
//! updates are repaired by the next beat, at most one interval later.

use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
pub struct Heartbeat {
    interval: Duration,
    last_beat: Option<Instant>,
    beats: u64,
}

impl Heartbeat {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_beat: None,
            beats: 0,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Whether a beat is due at `now`. The first beat is always due.
    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_beat {
            Some(last) => now.saturating_duration_since(last) >= self.interval,
            None => true,
        }
    }

    pub fn record(&mut self, now: Instant) {
        self.last_beat = Some(now);
        self.beats += 1;
    }

    /// Forget the last beat so the next one fires immediately.
    pub fn reset(&mut self) {
        self.last_beat = None;
    }

    pub fn beats(&self) -> u64 {
        self.beats
    }
}

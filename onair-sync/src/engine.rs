//! Reconciliation engine: one rundown document plus the production clock,
//! converged from local commands, remote events and bootstrap snapshots.
//!
//! ```text
//!   command ──► RoomEvent ──► apply(Local) ──► publish ──► peers
//!                                 ▲
//!   transport ──► RoomEvent ──────┤ apply(Remote)
//!   bootstrap ──► TimerSnapshot ──┘ apply(Bootstrap)
//! ```
//!
//! The engine is synchronous and owns no tasks. Every time-dependent entry
//! point takes `now` so the session driver (and tests) decide what time it is.
//!
//! Timer state machine:
//! ```text
//!            start                 pause
//!  STOPPED ────────► RUNNING ───────────► PAUSED
//!     ▲                 │  ▲                 │
//!     │  stop / end of  │  └──── start ──────┘
//!     └──── rundown ────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use onair_core::{normalize_status, Cursor, Folder, Item, Rundown, RundownSummary, TimerPhase, TimerState};
use tokio::time::Instant;
use uuid::Uuid;

use crate::bootstrap::BootstrapOutcome;
use crate::config::EngineConfig;
use crate::heartbeat::Heartbeat;
use crate::protocol::{RoomEvent, TimerUpdate};
use crate::reorder::{move_across, move_within, DragLock};

/// Outbound side of the engine. Implementations must not block.
pub trait Publisher {
    fn publish(&self, event: &RoomEvent);
}

/// Publisher that keeps every event in memory.
///
/// Useful for an engine running without a relay, and for inspecting what
/// an engine would have sent.
#[derive(Debug, Clone, Default)]
pub struct RecordingPublisher {
    events: Arc<Mutex<Vec<RoomEvent>>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drain everything published so far.
    pub fn take(&self) -> Vec<RoomEvent> {
        match self.events.lock() {
            Ok(mut events) => std::mem::take(&mut *events),
            Err(poisoned) => std::mem::take(&mut *poisoned.into_inner()),
        }
    }
}

impl Publisher for RecordingPublisher {
    fn publish(&self, event: &RoomEvent) {
        match self.events.lock() {
            Ok(mut events) => events.push(event.clone()),
            Err(poisoned) => poisoned.into_inner().push(event.clone()),
        }
    }
}

/// Where an event came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
    Bootstrap,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoreReason {
    /// Event room is neither the attached nor the navigation room.
    OtherRoom,
    /// Nothing attached, or no document loaded yet.
    NotAttached,
    /// Remote "running" within the recent-pause window.
    PauseGuard,
    /// Running update older than the local running clock.
    Stale,
    /// Remote structural edit during a local drag.
    DragLocked,
    /// Folder index out of range.
    NoSuchFolder,
    /// Command would not change anything.
    Unchanged,
}

/// Result of [`RundownEngine::apply`] and of the commands built on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Applied,
    Ignored(IgnoreReason),
}

impl Applied {
    pub fn is_applied(self) -> bool {
        self == Self::Applied
    }
}

/// Wall-clock anchor of a running timer.
#[derive(Debug, Clone, Copy)]
struct TickAnchor {
    base: u64,
    at: Instant,
}

pub struct RundownEngine<P: Publisher> {
    config: EngineConfig,
    publisher: P,
    room: Option<Uuid>,
    nav_room: Option<Uuid>,
    document: Option<Rundown>,
    timer: TimerState,
    anchor: Option<TickAnchor>,
    paused_at: Option<Instant>,
    drag: DragLock,
    heartbeat: Heartbeat,
    is_origin: bool,
    summaries: HashMap<Uuid, RundownSummary>,
    warning: Option<String>,
    ticker_epoch: u64,
}

impl<P: Publisher> RundownEngine<P> {
    pub fn new(config: EngineConfig, publisher: P) -> Self {
        let drag = DragLock::new(config.drag_grace);
        let heartbeat = Heartbeat::new(config.heartbeat_interval);
        Self {
            config,
            publisher,
            room: None,
            nav_room: None,
            document: None,
            timer: TimerState::stopped(),
            anchor: None,
            paused_at: None,
            drag,
            heartbeat,
            is_origin: false,
            summaries: HashMap::new(),
            warning: None,
            ticker_epoch: 0,
        }
    }

    // ── Accessors ───────────────────────────────────────────────

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn room(&self) -> Option<Uuid> {
        self.room
    }

    pub fn navigation_room(&self) -> Option<Uuid> {
        self.nav_room
    }

    pub fn document(&self) -> Option<&Rundown> {
        self.document.as_ref()
    }

    pub fn timer(&self) -> TimerState {
        self.timer
    }

    pub fn phase(&self) -> TimerPhase {
        self.timer.phase()
    }

    /// Seconds spent inside the item under the cursor.
    pub fn item_elapsed(&self) -> u64 {
        let start = self
            .document
            .as_ref()
            .map_or(0, |doc| doc.prefix_sum(self.timer.cursor));
        self.timer.time_elapsed.saturating_sub(start)
    }

    pub fn is_origin(&self) -> bool {
        self.is_origin
    }

    pub fn is_drag_locked(&self, now: Instant) -> bool {
        self.drag.is_held(now)
    }

    pub fn drag_release_deadline(&self) -> Option<Instant> {
        self.drag.release_deadline()
    }

    pub fn warning(&self) -> Option<&str> {
        self.warning.as_deref()
    }

    pub fn summaries(&self) -> Vec<RundownSummary> {
        let mut list: Vec<_> = self.summaries.values().cloned().collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    pub fn summary(&self, id: &Uuid) -> Option<&RundownSummary> {
        self.summaries.get(id)
    }

    /// Bumped on every cursor jump, start, pause, stop and detach. The
    /// driver rebuilds its ticker whenever this changes.
    pub fn ticker_epoch(&self) -> u64 {
        self.ticker_epoch
    }

    /// Instant the current run was anchored at, if running.
    pub fn tick_anchor(&self) -> Option<Instant> {
        self.anchor.map(|a| a.at)
    }

    pub fn heartbeats_sent(&self) -> u64 {
        self.heartbeat.beats()
    }

    // ── Attachment ──────────────────────────────────────────────

    /// Attach to `room`. The document and clock arrive through
    /// [`complete_bootstrap`](Self::complete_bootstrap).
    pub fn attach(&mut self, room: Uuid) {
        if self.room.is_some() {
            self.detach();
        }
        log::info!("Attaching to room {room}");
        self.room = Some(room);
        self.nav_room = Some(room);
        self.warning = None;
    }

    /// Drop the document and stop the local clock. Returns the room left.
    pub fn detach(&mut self) -> Option<Uuid> {
        let room = self.room.take();
        if let Some(room) = room {
            log::info!("Detaching from room {room}");
        }
        if self.nav_room == room {
            self.nav_room = None;
        }
        self.document = None;
        self.timer = TimerState::stopped();
        self.anchor = None;
        self.paused_at = None;
        self.is_origin = false;
        self.drag.clear();
        self.heartbeat.reset();
        self.warning = None;
        self.bump_epoch();
        room
    }

    /// Set the room the UI is navigating to. Timer events for it are
    /// applied even before the document finished loading.
    pub fn navigate(&mut self, room: Option<Uuid>) {
        self.nav_room = room;
    }

    /// Install a document for the attached room, replacing any loaded copy.
    pub fn load_document(&mut self, rundown: Rundown) -> Applied {
        if self.room != Some(rundown.id) {
            return Applied::Ignored(IgnoreReason::OtherRoom);
        }
        self.summaries.insert(rundown.id, rundown.summary());
        self.document = Some(rundown);
        self.revalidate_cursor();
        Applied::Applied
    }

    /// Apply what a late-joiner bootstrap fetched.
    ///
    /// A failed snapshot leaves the clock STOPPED and records a warning; it
    /// is never fatal.
    pub fn complete_bootstrap(&mut self, outcome: BootstrapOutcome, now: Instant) -> Applied {
        if self.room != Some(outcome.room) {
            log::debug!("Discarding bootstrap for stale room {}", outcome.room);
            return Applied::Ignored(IgnoreReason::OtherRoom);
        }

        let mut warnings = Vec::new();
        match outcome.document {
            Ok(rundown) => {
                self.load_document(rundown);
            }
            Err(e) => warnings.push(format!("document: {e}")),
        }

        let result = match outcome.snapshot {
            Ok(snapshot) => self.apply(
                RoomEvent::Timer {
                    room: outcome.room,
                    update: snapshot.into(),
                },
                Origin::Bootstrap,
                now,
            ),
            Err(e) => {
                log::warn!("Bootstrap snapshot for {} failed ({e}), starting stopped", outcome.room);
                self.force_stopped();
                warnings.push(format!("snapshot: {e}"));
                Applied::Applied
            }
        };

        if !warnings.is_empty() {
            self.warning = Some(format!("Bootstrap incomplete ({})", warnings.join("; ")));
        }
        result
    }

    /// Replace the cached list of rundown summaries.
    pub fn cache_summaries(&mut self, summaries: Vec<RundownSummary>) {
        self.summaries = summaries.into_iter().map(|s| (s.id, s)).collect();
    }

    // ── Event application ───────────────────────────────────────

    /// Apply one event. Never fails; ignored events are reported.
    pub fn apply(&mut self, event: RoomEvent, origin: Origin, now: Instant) -> Applied {
        let outcome = match event {
            RoomEvent::Timer { room, update } => self.apply_timer(room, update, origin, now),
            RoomEvent::Cursor {
                room,
                cursor,
                time_elapsed,
            } => self.apply_cursor(room, cursor, time_elapsed, now),
            RoomEvent::Status { room, status } => self.apply_status(room, &status),
            structural => self.apply_structure(structural, origin, now),
        };
        if let Applied::Ignored(reason) = outcome {
            log::debug!("Ignored {origin:?} event: {reason:?}");
        }
        outcome
    }

    fn accepts_timer_room(&self, room: Uuid) -> bool {
        self.room == Some(room) || self.nav_room == Some(room)
    }

    fn pause_guard_active(&self, now: Instant) -> bool {
        self.paused_at
            .is_some_and(|at| now.saturating_duration_since(at) < self.config.pause_guard_window)
    }

    fn apply_timer(&mut self, room: Uuid, update: TimerUpdate, origin: Origin, now: Instant) -> Applied {
        if !self.accepts_timer_room(room) {
            return Applied::Ignored(IgnoreReason::OtherRoom);
        }
        if origin == Origin::Remote && update.is_running && self.pause_guard_active(now) {
            return Applied::Ignored(IgnoreReason::PauseGuard);
        }
        if let Some(incoming) = update.time_elapsed {
            let both_running = update.is_running && self.timer.is_running;
            if both_running && incoming < self.timer.time_elapsed && incoming != 0 {
                return Applied::Ignored(IgnoreReason::Stale);
            }
            self.timer.time_elapsed = incoming;
        }
        if let Some(cursor) = update.cursor {
            self.timer.cursor = self.validated(cursor);
        }

        self.timer.is_running = update.is_running;
        if update.is_running {
            if origin == Origin::Remote {
                self.is_origin = false;
            }
            self.anchor_at(now);
        } else {
            self.anchor = None;
            self.bump_epoch();
        }
        Applied::Applied
    }

    fn apply_cursor(&mut self, room: Uuid, cursor: Cursor, time_elapsed: Option<u64>, now: Instant) -> Applied {
        if !self.accepts_timer_room(room) {
            return Applied::Ignored(IgnoreReason::OtherRoom);
        }
        if cursor.is_origin() && time_elapsed.unwrap_or(0) == 0 {
            self.timer.cursor = Cursor::ORIGIN;
            self.timer.time_elapsed = 0;
            self.paused_at = None;
        } else {
            let cursor = self.validated(cursor);
            self.timer.cursor = cursor;
            self.timer.time_elapsed = match time_elapsed {
                Some(t) => t,
                None => self.prefix_sum(cursor),
            };
        }
        if self.timer.is_running {
            self.anchor_at(now);
        } else {
            self.bump_epoch();
        }
        Applied::Applied
    }

    fn apply_status(&mut self, room: Uuid, status: &str) -> Applied {
        let status = normalize_status(status);
        let mut touched = false;
        if self.room == Some(room) {
            if let Some(doc) = self.document.as_mut() {
                doc.status = status.clone();
                touched = true;
            }
        }
        if let Some(summary) = self.summaries.get_mut(&room) {
            summary.status = status;
            touched = true;
        }
        if touched {
            Applied::Applied
        } else {
            Applied::Ignored(IgnoreReason::NotAttached)
        }
    }

    fn apply_structure(&mut self, event: RoomEvent, origin: Origin, now: Instant) -> Applied {
        if self.room != Some(event.room()) {
            return Applied::Ignored(IgnoreReason::OtherRoom);
        }
        if origin == Origin::Remote && self.drag.is_held(now) {
            return Applied::Ignored(IgnoreReason::DragLocked);
        }
        let Some(doc) = self.document.as_mut() else {
            return Applied::Ignored(IgnoreReason::NotAttached);
        };
        match event {
            RoomEvent::StructureReplace { items, .. } => doc.items = items,
            RoomEvent::FolderReorder { new_order, .. } => doc.items = new_order,
            RoomEvent::ItemReorder {
                folder_index,
                new_order,
                ..
            } => match doc.items.get_mut(folder_index) {
                Some(folder) => folder.children = new_order,
                None => {
                    log::warn!("Item reorder for missing folder {folder_index}");
                    return Applied::Ignored(IgnoreReason::NoSuchFolder);
                }
            },
            _ => return Applied::Ignored(IgnoreReason::Unchanged),
        }
        self.revalidate_cursor();
        Applied::Applied
    }

    // ── Timer commands ──────────────────────────────────────────

    /// PAUSED|STOPPED → RUNNING. This engine becomes the heartbeat origin.
    pub fn start(&mut self, now: Instant) -> Applied {
        let Some(room) = self.room else {
            return Applied::Ignored(IgnoreReason::NotAttached);
        };
        if self.timer.is_running {
            return Applied::Ignored(IgnoreReason::Unchanged);
        }
        let update = TimerUpdate {
            is_running: true,
            time_elapsed: Some(self.timer.time_elapsed),
            cursor: Some(self.timer.cursor),
        };
        self.paused_at = None;
        let outcome = self.local(RoomEvent::Timer { room, update }, now);
        if outcome.is_applied() {
            self.is_origin = true;
            self.heartbeat.record(now);
        }
        outcome
    }

    /// RUNNING → PAUSED. Arms the recent-pause guard.
    pub fn pause(&mut self, now: Instant) -> Applied {
        let Some(room) = self.room else {
            return Applied::Ignored(IgnoreReason::NotAttached);
        };
        if !self.timer.is_running {
            return Applied::Ignored(IgnoreReason::Unchanged);
        }
        self.tick(now);
        if !self.timer.is_running {
            // The catch-up tick ran off the end of the rundown.
            return Applied::Applied;
        }
        let update = TimerUpdate {
            is_running: false,
            time_elapsed: Some(self.timer.time_elapsed),
            cursor: Some(self.timer.cursor),
        };
        let outcome = self.local(RoomEvent::Timer { room, update }, now);
        self.paused_at = Some(now);
        outcome
    }

    /// Any state → STOPPED, published.
    pub fn stop(&mut self, now: Instant) -> Applied {
        let Some(room) = self.room else {
            return Applied::Ignored(IgnoreReason::NotAttached);
        };
        self.publish_reset(room, now)
    }

    /// Manual advance to the next item. At the end of the rundown this
    /// stops and publishes the reset.
    pub fn next(&mut self, now: Instant) -> Applied {
        let Some(room) = self.room else {
            return Applied::Ignored(IgnoreReason::NotAttached);
        };
        let Some(doc) = self.document.as_ref() else {
            return Applied::Ignored(IgnoreReason::NotAttached);
        };
        match doc.next_cursor(self.timer.cursor) {
            Some(next) => self.set_cursor(next, now),
            None => self.publish_reset(room, now),
        }
    }

    /// Jump to `cursor`; time becomes its prefix sum.
    pub fn set_cursor(&mut self, cursor: Cursor, now: Instant) -> Applied {
        let Some(room) = self.room else {
            return Applied::Ignored(IgnoreReason::NotAttached);
        };
        let cursor = self.validated(cursor);
        let event = RoomEvent::Cursor {
            room,
            cursor,
            time_elapsed: Some(self.prefix_sum(cursor)),
        };
        self.local(event, now)
    }

    /// Advance the running clock to `now`, auto-advancing past finished
    /// items. Returns whether anything changed.
    pub fn tick(&mut self, now: Instant) -> bool {
        if !self.timer.is_running {
            return false;
        }
        let Some(anchor) = self.anchor else {
            return false;
        };
        let target = anchor
            .base
            .saturating_add(now.saturating_duration_since(anchor.at).as_secs());
        let mut changed = false;
        if target > self.timer.time_elapsed {
            log::trace!("Tick {} -> {target}", self.timer.time_elapsed);
            self.timer.time_elapsed = target;
            changed = true;
        }
        self.auto_advance(now) || changed
    }

    fn auto_advance(&mut self, now: Instant) -> bool {
        let Some(room) = self.room else {
            return false;
        };
        let mut advanced = false;
        loop {
            let Some(doc) = self.document.as_ref() else {
                break;
            };
            let Some(item) = doc.item(self.timer.cursor) else {
                break;
            };
            let item_end = doc.prefix_sum(self.timer.cursor) + u64::from(item.duration);
            if self.timer.time_elapsed < item_end {
                break;
            }
            match doc.next_cursor(self.timer.cursor) {
                Some(next) => {
                    log::info!("Auto-advance {} -> {next}", self.timer.cursor);
                    self.timer.cursor = next;
                    advanced = true;
                }
                None => {
                    log::info!("End of rundown reached in room {room}");
                    if self.is_origin {
                        self.publish_reset(room, now);
                    } else {
                        self.force_stopped();
                    }
                    return true;
                }
            }
        }
        if advanced && self.is_origin {
            self.publish_running(room);
        }
        advanced
    }

    /// Re-publish the running clock if this engine is the origin and a beat
    /// is due. Returns whether a beat went out.
    pub fn heartbeat(&mut self, now: Instant) -> bool {
        let Some(room) = self.room else {
            return false;
        };
        if !self.timer.is_running || !self.is_origin || !self.heartbeat.is_due(now) {
            return false;
        }
        self.tick(now);
        if !self.timer.is_running {
            return false;
        }
        log::trace!("Heartbeat for room {room} at {}s", self.timer.time_elapsed);
        self.publish_running(room);
        self.heartbeat.record(now);
        true
    }

    fn publish_running(&self, room: Uuid) {
        let update = TimerUpdate {
            is_running: true,
            time_elapsed: Some(self.timer.time_elapsed),
            cursor: Some(self.timer.cursor),
        };
        self.publisher.publish(&RoomEvent::Timer { room, update });
    }

    fn publish_reset(&mut self, room: Uuid, now: Instant) -> Applied {
        let update = TimerUpdate {
            is_running: false,
            time_elapsed: Some(0),
            cursor: Some(Cursor::ORIGIN),
        };
        let outcome = self.local(RoomEvent::Timer { room, update }, now);
        self.force_stopped();
        outcome
    }

    fn force_stopped(&mut self) {
        self.timer = TimerState::stopped();
        self.anchor = None;
        self.is_origin = false;
        self.paused_at = None;
        self.bump_epoch();
    }

    // ── Structure commands ──────────────────────────────────────

    pub fn begin_drag(&mut self) {
        self.drag.begin();
    }

    pub fn end_drag(&mut self, now: Instant) {
        self.drag.end(now);
    }

    /// Move an item inside folder `folder_index`.
    pub fn reorder_item(&mut self, folder_index: usize, from: usize, insert: usize, now: Instant) -> Applied {
        let (Some(room), Some(doc)) = (self.room, self.document.as_ref()) else {
            return Applied::Ignored(IgnoreReason::NotAttached);
        };
        let Some(folder) = doc.items.get(folder_index) else {
            return Applied::Ignored(IgnoreReason::NoSuchFolder);
        };
        let mut new_order: Vec<Item> = folder.children.clone();
        if !move_within(&mut new_order, from, insert) {
            return Applied::Ignored(IgnoreReason::Unchanged);
        }
        self.local(
            RoomEvent::ItemReorder {
                room,
                folder_index,
                new_order,
            },
            now,
        )
    }

    pub fn reorder_folder(&mut self, from: usize, insert: usize, now: Instant) -> Applied {
        let (Some(room), Some(doc)) = (self.room, self.document.as_ref()) else {
            return Applied::Ignored(IgnoreReason::NotAttached);
        };
        let mut new_order: Vec<Folder> = doc.items.clone();
        if !move_within(&mut new_order, from, insert) {
            return Applied::Ignored(IgnoreReason::Unchanged);
        }
        self.local(RoomEvent::FolderReorder { room, new_order }, now)
    }

    /// Move an item to another folder. Sent as one whole-tree replace.
    pub fn move_item(&mut self, from: Cursor, to_folder: usize, insert: usize, now: Instant) -> Applied {
        let (Some(room), Some(doc)) = (self.room, self.document.as_ref()) else {
            return Applied::Ignored(IgnoreReason::NotAttached);
        };
        let mut items = doc.items.clone();
        if !move_across(&mut items, from, to_folder, insert) {
            return Applied::Ignored(IgnoreReason::Unchanged);
        }
        self.local(RoomEvent::StructureReplace { room, items }, now)
    }

    /// Replace the whole folder tree (add, remove or edit items).
    pub fn mutate_structure(&mut self, items: Vec<Folder>, now: Instant) -> Applied {
        let Some(room) = self.room else {
            return Applied::Ignored(IgnoreReason::NotAttached);
        };
        self.local(RoomEvent::StructureReplace { room, items }, now)
    }

    pub fn set_status(&mut self, status: &str, now: Instant) -> Applied {
        let Some(room) = self.room else {
            return Applied::Ignored(IgnoreReason::NotAttached);
        };
        self.local(
            RoomEvent::Status {
                room,
                status: normalize_status(status),
            },
            now,
        )
    }

    // ── Helpers ─────────────────────────────────────────────────

    /// Apply locally, then publish if it took.
    fn local(&mut self, event: RoomEvent, now: Instant) -> Applied {
        let outcome = self.apply(event.clone(), Origin::Local, now);
        if outcome.is_applied() {
            self.publisher.publish(&event);
        }
        outcome
    }

    fn prefix_sum(&self, cursor: Cursor) -> u64 {
        self.document.as_ref().map_or(0, |doc| doc.prefix_sum(cursor))
    }

    /// A cursor that does not resolve in the loaded document becomes (0,0).
    /// Without a document there is nothing to check against yet.
    fn validated(&self, cursor: Cursor) -> Cursor {
        match &self.document {
            Some(doc) if !doc.resolves(cursor) => {
                if !cursor.is_origin() {
                    log::warn!("Cursor {cursor} does not resolve, falling back to origin");
                }
                Cursor::ORIGIN
            }
            _ => cursor,
        }
    }

    fn revalidate_cursor(&mut self) {
        let cursor = self.validated(self.timer.cursor);
        if cursor != self.timer.cursor {
            self.timer.cursor = cursor;
            self.bump_epoch();
        }
    }

    fn anchor_at(&mut self, now: Instant) {
        self.anchor = Some(TickAnchor {
            base: self.timer.time_elapsed,
            at: now,
        });
        self.bump_epoch();
    }

    fn bump_epoch(&mut self) {
        self.ticker_epoch = self.ticker_epoch.wrapping_add(1);
    }
}

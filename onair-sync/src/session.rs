//! Session driver: the task that owns one client's [`RundownEngine`].
//!
//! ```text
//!   SessionHandle ──commands──┐
//!   transport ──inbound───────┤
//!   ticker (per epoch) ───────┼──► select! ──► engine ──► watch<ReadModel>
//!   heartbeat interval ───────┤
//!   bootstrap task ───────────┤
//!   connection state ─────────┘
//! ```
//!
//! The engine never sees a lock. Commands are fire-and-forget; the UI reads
//! state back through the [`ReadModel`] watch channel.

use std::future::pending;

use onair_core::{Cursor, Folder, Rundown, RundownSummary, TimerPhase};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep_until, Instant, Interval, MissedTickBehavior};
use uuid::Uuid;

use crate::bootstrap::{bootstrap, BootstrapOutcome, DocumentSource, SnapshotSource};
use crate::config::EngineConfig;
use crate::engine::{Origin, Publisher, RundownEngine};
use crate::transport::{ConnectionState, EventFilter, Inbound, Transport};

/// Everything a session needs from the network side.
pub trait RoomLink: Publisher + SnapshotSource + DocumentSource + Clone + Send + Sync + 'static {
    fn join_room(&self, room: Uuid);
    fn leave_room(&self, room: Uuid);
}

impl RoomLink for Transport {
    fn join_room(&self, room: Uuid) {
        self.join(room);
    }

    fn leave_room(&self, room: Uuid) {
        self.leave(room);
    }
}

/// Snapshot of session state for the UI.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadModel {
    pub room: Option<Uuid>,
    pub document: Option<Rundown>,
    pub cursor: Cursor,
    pub is_running: bool,
    pub time_elapsed: u64,
    pub item_elapsed: u64,
    pub phase: TimerPhase,
    pub connected: bool,
    pub drag_locked: bool,
    pub warning: Option<String>,
    pub summaries: Vec<RundownSummary>,
}

impl ReadModel {
    fn empty(connected: bool) -> Self {
        Self {
            room: None,
            document: None,
            cursor: Cursor::ORIGIN,
            is_running: false,
            time_elapsed: 0,
            item_elapsed: 0,
            phase: TimerPhase::Stopped,
            connected,
            drag_locked: false,
            warning: None,
            summaries: Vec::new(),
        }
    }
}

#[derive(Debug)]
enum Command {
    Attach(Uuid),
    Detach,
    Navigate(Option<Uuid>),
    Start,
    Pause,
    Stop,
    Next,
    SetCursor(Cursor),
    ReorderItem { folder: usize, from: usize, insert: usize },
    ReorderFolder { from: usize, insert: usize },
    MoveItem { from: Cursor, to_folder: usize, insert: usize },
    MutateStructure(Vec<Folder>),
    SetStatus(String),
    BeginDrag,
    EndDrag,
    CacheSummaries(Vec<RundownSummary>),
    Shutdown,
}

/// The session task has exited.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionClosed;

impl std::fmt::Display for SessionClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Session closed")
    }
}

impl std::error::Error for SessionClosed {}

/// Cloneable handle to a running session. The session stops when the last
/// handle is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    model: watch::Receiver<ReadModel>,
}

impl SessionHandle {
    fn send(&self, command: Command) -> Result<(), SessionClosed> {
        self.commands.send(command).map_err(|_| SessionClosed)
    }

    /// Current read model.
    pub fn read_model(&self) -> ReadModel {
        self.model.borrow().clone()
    }

    /// Watch the read model for changes.
    pub fn watch(&self) -> watch::Receiver<ReadModel> {
        self.model.clone()
    }

    pub fn attach(&self, room: Uuid) -> Result<(), SessionClosed> {
        self.send(Command::Attach(room))
    }

    pub fn detach(&self) -> Result<(), SessionClosed> {
        self.send(Command::Detach)
    }

    pub fn navigate(&self, room: Option<Uuid>) -> Result<(), SessionClosed> {
        self.send(Command::Navigate(room))
    }

    pub fn start(&self) -> Result<(), SessionClosed> {
        self.send(Command::Start)
    }

    pub fn pause(&self) -> Result<(), SessionClosed> {
        self.send(Command::Pause)
    }

    pub fn stop(&self) -> Result<(), SessionClosed> {
        self.send(Command::Stop)
    }

    pub fn next(&self) -> Result<(), SessionClosed> {
        self.send(Command::Next)
    }

    pub fn set_cursor(&self, cursor: Cursor) -> Result<(), SessionClosed> {
        self.send(Command::SetCursor(cursor))
    }

    pub fn reorder_item(&self, folder: usize, from: usize, insert: usize) -> Result<(), SessionClosed> {
        self.send(Command::ReorderItem { folder, from, insert })
    }

    pub fn reorder_folder(&self, from: usize, insert: usize) -> Result<(), SessionClosed> {
        self.send(Command::ReorderFolder { from, insert })
    }

    pub fn move_item(&self, from: Cursor, to_folder: usize, insert: usize) -> Result<(), SessionClosed> {
        self.send(Command::MoveItem { from, to_folder, insert })
    }

    pub fn mutate_structure(&self, items: Vec<Folder>) -> Result<(), SessionClosed> {
        self.send(Command::MutateStructure(items))
    }

    pub fn set_status(&self, status: impl Into<String>) -> Result<(), SessionClosed> {
        self.send(Command::SetStatus(status.into()))
    }

    pub fn begin_drag(&self) -> Result<(), SessionClosed> {
        self.send(Command::BeginDrag)
    }

    pub fn end_drag(&self) -> Result<(), SessionClosed> {
        self.send(Command::EndDrag)
    }

    pub fn cache_summaries(&self, summaries: Vec<RundownSummary>) -> Result<(), SessionClosed> {
        self.send(Command::CacheSummaries(summaries))
    }

    /// Detach and stop the session task.
    pub fn shutdown(&self) -> Result<(), SessionClosed> {
        self.send(Command::Shutdown)
    }
}

pub struct Session<L: RoomLink> {
    engine: RundownEngine<L>,
    link: L,
    commands: mpsc::UnboundedReceiver<Command>,
    inbound: Option<mpsc::Receiver<Inbound>>,
    connection: Option<watch::Receiver<ConnectionState>>,
    connected: bool,
    model: watch::Sender<ReadModel>,
    ticker: Option<Interval>,
    ticker_epoch: Option<u64>,
    heartbeat: Option<Interval>,
    pending_bootstrap: Option<JoinHandle<BootstrapOutcome>>,
}

impl Session<Transport> {
    /// Start a session on top of a client transport.
    pub fn with_transport(config: EngineConfig, transport: Transport) -> SessionHandle {
        let inbound = transport.subscribe(EventFilter::All);
        let connection = transport.state_changes();
        Self::spawn(config, transport, inbound, Some(connection))
    }
}

impl<L: RoomLink> Session<L> {
    /// Spawn the session task.
    ///
    /// Without a connection watch the session reports itself connected.
    pub fn spawn(
        config: EngineConfig,
        link: L,
        inbound: mpsc::Receiver<Inbound>,
        connection: Option<watch::Receiver<ConnectionState>>,
    ) -> SessionHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let connected = connection
            .as_ref()
            .map_or(true, |rx| *rx.borrow() == ConnectionState::Connected);
        let (model_tx, model_rx) = watch::channel(ReadModel::empty(connected));

        let session = Session {
            engine: RundownEngine::new(config, link.clone()),
            link,
            commands: cmd_rx,
            inbound: Some(inbound),
            connection,
            connected,
            model: model_tx,
            ticker: None,
            ticker_epoch: None,
            heartbeat: None,
            pending_bootstrap: None,
        };
        tokio::spawn(session.run());

        SessionHandle {
            commands: cmd_tx,
            model: model_rx,
        }
    }

    async fn run(mut self) {
        loop {
            // Republish once a released drag lock lapses.
            let drag_release = if self.model.borrow().drag_locked {
                self.engine.drag_release_deadline()
            } else {
                None
            };

            tokio::select! {
                command = self.commands.recv() => {
                    match command {
                        Some(Command::Shutdown) | None => break,
                        Some(command) => self.handle_command(command),
                    }
                }

                inbound = recv_inbound(&mut self.inbound) => {
                    match inbound {
                        Some(Inbound { from, event }) => {
                            let kind = event.kind();
                            let outcome = self.engine.apply(event, Origin::Remote, Instant::now());
                            log::trace!("{kind:?} from {from}: {outcome:?}");
                        }
                        None => {
                            log::warn!("Inbound event stream closed");
                            self.inbound = None;
                        }
                    }
                }

                _ = tick_opt(&mut self.ticker) => {
                    self.engine.tick(Instant::now());
                }

                _ = tick_opt(&mut self.heartbeat) => {
                    self.engine.heartbeat(Instant::now());
                }

                outcome = join_bootstrap(&mut self.pending_bootstrap) => {
                    self.pending_bootstrap = None;
                    match outcome {
                        Ok(outcome) => {
                            self.engine.complete_bootstrap(outcome, Instant::now());
                        }
                        Err(e) => log::error!("Bootstrap task failed: {e}"),
                    }
                }

                _ = wait_until(drag_release) => {}

                changed = changed_opt(&mut self.connection) => {
                    match changed {
                        Some(state) => {
                            log::debug!("Connection state: {state:?}");
                            self.connected = state == ConnectionState::Connected;
                        }
                        None => {
                            self.connection = None;
                            self.connected = false;
                        }
                    }
                }
            }

            self.sync_timers();
            self.publish_model();
        }

        self.abort_bootstrap();
        if let Some(room) = self.engine.detach() {
            self.link.leave_room(room);
        }
        log::info!("Session stopped");
    }

    fn handle_command(&mut self, command: Command) {
        let now = Instant::now();
        let outcome = match command {
            Command::Attach(room) => {
                self.abort_bootstrap();
                if let Some(previous) = self.engine.detach() {
                    self.link.leave_room(previous);
                }
                self.engine.attach(room);
                self.link.join_room(room);
                let link = self.link.clone();
                let limit = self.engine.config().bootstrap_timeout;
                self.pending_bootstrap = Some(tokio::spawn(async move {
                    bootstrap(&link, &link, room, limit).await
                }));
                return;
            }
            Command::Detach => {
                self.abort_bootstrap();
                if let Some(room) = self.engine.detach() {
                    self.link.leave_room(room);
                }
                return;
            }
            Command::Navigate(room) => {
                self.engine.navigate(room);
                return;
            }
            Command::Start => self.engine.start(now),
            Command::Pause => self.engine.pause(now),
            Command::Stop => self.engine.stop(now),
            Command::Next => self.engine.next(now),
            Command::SetCursor(cursor) => self.engine.set_cursor(cursor, now),
            Command::ReorderItem { folder, from, insert } => self.engine.reorder_item(folder, from, insert, now),
            Command::ReorderFolder { from, insert } => self.engine.reorder_folder(from, insert, now),
            Command::MoveItem { from, to_folder, insert } => self.engine.move_item(from, to_folder, insert, now),
            Command::MutateStructure(items) => self.engine.mutate_structure(items, now),
            Command::SetStatus(status) => self.engine.set_status(&status, now),
            Command::BeginDrag => {
                self.engine.begin_drag();
                return;
            }
            Command::EndDrag => {
                self.engine.end_drag(now);
                return;
            }
            Command::CacheSummaries(summaries) => {
                self.engine.cache_summaries(summaries);
                return;
            }
            Command::Shutdown => return,
        };
        log::debug!("Command outcome: {outcome:?}");
    }

    fn abort_bootstrap(&mut self) {
        if let Some(handle) = self.pending_bootstrap.take() {
            handle.abort();
        }
    }

    /// Recreate the ticker on every epoch change; drop both intervals when
    /// the clock is not running.
    fn sync_timers(&mut self) {
        let running = self.engine.room().is_some() && self.engine.timer().is_running;
        let period = self.engine.config().tick_interval;

        match (running, self.engine.tick_anchor()) {
            (true, Some(anchor)) => {
                let epoch = self.engine.ticker_epoch();
                if self.ticker.is_none() || self.ticker_epoch != Some(epoch) {
                    let mut ticker = interval_at(anchor + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
                    self.ticker = Some(ticker);
                    self.ticker_epoch = Some(epoch);
                }
            }
            _ => {
                self.ticker = None;
                self.ticker_epoch = None;
            }
        }

        if running && self.engine.is_origin() {
            if self.heartbeat.is_none() {
                let period = self.engine.config().heartbeat_interval;
                let mut heartbeat = interval_at(Instant::now() + period, period);
                heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(heartbeat);
            }
        } else {
            self.heartbeat = None;
        }
    }

    fn publish_model(&self) {
        let engine = &self.engine;
        let timer = engine.timer();
        let next = ReadModel {
            room: engine.room(),
            document: engine.document().cloned(),
            cursor: timer.cursor,
            is_running: timer.is_running,
            time_elapsed: timer.time_elapsed,
            item_elapsed: engine.item_elapsed(),
            phase: engine.phase(),
            connected: self.connected,
            drag_locked: engine.is_drag_locked(Instant::now()),
            warning: engine.warning().map(str::to_string),
            summaries: engine.summaries(),
        };
        self.model.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn recv_inbound(rx: &mut Option<mpsc::Receiver<Inbound>>) -> Option<Inbound> {
    match rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn tick_opt(interval: &mut Option<Interval>) -> Instant {
    match interval {
        Some(interval) => interval.tick().await,
        None => pending().await,
    }
}

async fn join_bootstrap(
    handle: &mut Option<JoinHandle<BootstrapOutcome>>,
) -> Result<BootstrapOutcome, tokio::task::JoinError> {
    match handle {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}

async fn changed_opt(rx: &mut Option<watch::Receiver<ConnectionState>>) -> Option<ConnectionState> {
    match rx {
        Some(rx) => match rx.changed().await {
            Ok(()) => Some(*rx.borrow_and_update()),
            Err(_) => None,
        },
        None => pending().await,
    }
}

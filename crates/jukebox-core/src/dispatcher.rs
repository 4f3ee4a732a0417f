//! Single-owner event loop for all mutable playback state.
//!
//! Every caller (socket clients, the HTTP API, signal handlers, the audio
//! backend's completion callbacks) only ever pushes a [`Command`] onto an
//! unbounded queue.  The loop owns the timeline, the state machine and the
//! watcher registry exclusively and runs one command at a time, in order.
//!
//! Two command kinds are debounced instead of queued straight through:
//! play/pause toggles (250 ms, cancel-and-replace) and checkpoints (5 s after
//! the last timeline mutation).  Position/duration queries skip the queue
//! and take the controller lock directly; the loop holds the same lock
//! whenever it drives the controller.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, info, warn};

use crate::collab::{AwakeGuard, Catalog, PlaybackController, PresentationSink};
use crate::error::{Error, Result};
use crate::persist::{self, Snapshot, SnapshotStore};
use crate::prefs::{PreferenceKey, PreferenceSource, Preferences};
use crate::protocol::Status;
use crate::state::{EntryAction, PlaybackState, StateMachine};
use crate::timeline::Timeline;
use crate::track::{Track, TrackId};
use crate::watchers::{Watcher, WatcherId, WatcherRegistry};

/// Window in which a second play/pause toggle replaces the first.
pub const TOGGLE_DEBOUNCE: Duration = Duration::from_millis(250);
/// Quiet period after the last timeline mutation before a checkpoint is written.
pub const CHECKPOINT_DELAY: Duration = Duration::from_millis(5000);

/// The audio backend, shared between the loop and the synchronous
/// position/duration queries.
pub type SharedController = Arc<Mutex<dyn PlaybackController>>;

pub enum QueueRequest {
    Track(TrackId),
    /// Start queueing right after the current track again.
    Reset,
}

/// All inputs into the dispatcher loop.
pub enum Command {
    /// Re-read one preference key.
    PreferenceChanged(String),
    QueueItem(QueueRequest),
    /// Move to the next track (end of track, load failure).
    TrackAdvance,
    ReleaseGuard,
    CatalogRefresh,
    /// Entering (`true`) or leaving (`false`) a phone call.
    CallInterrupt(bool),
    HeadsetChanged(bool),
    /// `0` toggles play/pause (debounced); anything else skips by that many tracks.
    TogglePlayOrSkip(i32),
    SetState(PlaybackState),
    /// Schedule a checkpoint; debounced like mutation-triggered ones.
    Checkpoint,
    /// Pre-extend the timeline, evict history, schedule a checkpoint.
    WindowMaintenance,
    SeekToProgress(u32),
    PresentationRefresh,
    Register(WatcherId, Box<dyn Watcher>),
    Unregister(WatcherId),
    SongQuery(i32, oneshot::Sender<Option<Track>>),
    StatusQuery(oneshot::Sender<Status>),
    Shutdown,
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::PreferenceChanged(key) => write!(f, "PreferenceChanged({key})"),
            Command::QueueItem(QueueRequest::Track(id)) => write!(f, "QueueItem({id})"),
            Command::QueueItem(QueueRequest::Reset) => f.write_str("QueueItem(reset)"),
            Command::TrackAdvance => f.write_str("TrackAdvance"),
            Command::ReleaseGuard => f.write_str("ReleaseGuard"),
            Command::CatalogRefresh => f.write_str("CatalogRefresh"),
            Command::CallInterrupt(in_call) => write!(f, "CallInterrupt({in_call})"),
            Command::HeadsetChanged(plugged) => write!(f, "HeadsetChanged({plugged})"),
            Command::TogglePlayOrSkip(delta) => write!(f, "TogglePlayOrSkip({delta})"),
            Command::SetState(state) => write!(f, "SetState({state})"),
            Command::Checkpoint => f.write_str("Checkpoint"),
            Command::WindowMaintenance => f.write_str("WindowMaintenance"),
            Command::SeekToProgress(permille) => write!(f, "SeekToProgress({permille})"),
            Command::PresentationRefresh => f.write_str("PresentationRefresh"),
            Command::Register(id, _) => write!(f, "Register({id:?})"),
            Command::Unregister(id) => write!(f, "Unregister({id:?})"),
            Command::SongQuery(delta, _) => write!(f, "SongQuery({delta})"),
            Command::StatusQuery(_) => f.write_str("StatusQuery"),
            Command::Shutdown => f.write_str("Shutdown"),
        }
    }
}

pub fn channel() -> (mpsc::UnboundedSender<Command>, mpsc::UnboundedReceiver<Command>) {
    mpsc::unbounded_channel()
}

fn lock(player: &SharedController) -> MutexGuard<'_, dyn PlaybackController + 'static> {
    // A panic inside the backend leaves nothing half-written on our side.
    player.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ── PlayerHandle ──────────────────────────────────────────────────────────────

/// Cheaply cloneable front door to the dispatcher.  Submission never blocks
/// and works from any thread.
#[derive(Clone)]
pub struct PlayerHandle {
    tx: mpsc::UnboundedSender<Command>,
    player: SharedController,
}

impl PlayerHandle {
    pub fn new(tx: mpsc::UnboundedSender<Command>, player: SharedController) -> Self {
        Self { tx, player }
    }

    pub fn submit(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).map_err(|_| Error::DispatcherGone)
    }

    pub fn toggle_playback(&self) -> Result<()> {
        self.submit(Command::TogglePlayOrSkip(0))
    }

    pub fn skip(&self, delta: i32) -> Result<()> {
        self.submit(Command::TogglePlayOrSkip(delta))
    }

    pub fn seek_to_progress(&self, permille: u32) -> Result<()> {
        self.submit(Command::SeekToProgress(permille))
    }

    pub fn enqueue(&self, id: TrackId) -> Result<()> {
        self.submit(Command::QueueItem(QueueRequest::Track(id)))
    }

    pub fn reset_queue(&self) -> Result<()> {
        self.submit(Command::QueueItem(QueueRequest::Reset))
    }

    pub fn catalog_changed(&self) -> Result<()> {
        self.submit(Command::CatalogRefresh)
    }

    pub fn headset_changed(&self, plugged: bool) -> Result<()> {
        self.submit(Command::HeadsetChanged(plugged))
    }

    pub fn call_state_changed(&self, in_call: bool) -> Result<()> {
        self.submit(Command::CallInterrupt(in_call))
    }

    pub fn preference_changed(&self, key: impl Into<String>) -> Result<()> {
        self.submit(Command::PreferenceChanged(key.into()))
    }

    pub fn refresh_presentation(&self) -> Result<()> {
        self.submit(Command::PresentationRefresh)
    }

    pub fn register(&self, watcher: Box<dyn Watcher>) -> Result<WatcherId> {
        let id = WatcherId::next();
        self.submit(Command::Register(id, watcher))?;
        Ok(id)
    }

    pub fn unregister(&self, id: WatcherId) -> Result<()> {
        self.submit(Command::Unregister(id))
    }

    /// Track at `delta` from the current one.  Goes through the queue since
    /// asking one past the end grows the timeline.
    pub async fn song(&self, delta: i32) -> Result<Option<Track>> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::SongQuery(delta, reply))?;
        rx.await.map_err(|_| Error::DispatcherGone)
    }

    pub async fn status(&self) -> Result<Status> {
        let (reply, rx) = oneshot::channel();
        self.submit(Command::StatusQuery(reply))?;
        rx.await.map_err(|_| Error::DispatcherGone)
    }

    pub fn position_ms(&self) -> u32 {
        lock(&self.player).position_ms()
    }

    pub fn duration_ms(&self) -> u32 {
        lock(&self.player).duration_ms()
    }
}

// ── Service ───────────────────────────────────────────────────────────────────

/// Everything the dispatcher needs, assembled by the host.
pub struct Setup {
    pub tx: mpsc::UnboundedSender<Command>,
    pub rx: mpsc::UnboundedReceiver<Command>,
    pub player: SharedController,
    pub catalog: Box<dyn Catalog>,
    pub sink: Box<dyn PresentationSink>,
    pub store: Box<dyn SnapshotStore>,
    pub preference_source: Box<dyn PreferenceSource>,
    pub preferences: Preferences,
    pub guard: AwakeGuard,
    pub seed: u64,
}

/// A running dispatcher.  `start` produces it, `shutdown` consumes it.
/// Dropping it instead stops the loop once the last [`PlayerHandle`] (and
/// [`crate::collab::PlaybackSignals`]) is gone; the final checkpoint is still
/// written.
pub struct Service {
    handle: PlayerHandle,
    task: JoinHandle<()>,
}

impl Service {
    pub fn start(setup: Setup) -> Self {
        let handle = PlayerHandle::new(setup.tx.clone(), setup.player.clone());
        let (dispatcher, rx) = Dispatcher::new(setup);
        let task = tokio::spawn(dispatcher.run(rx));
        Self { handle, task }
    }

    pub fn handle(&self) -> PlayerHandle {
        self.handle.clone()
    }

    /// Stop the loop after everything already queued, flushing the final
    /// checkpoint.
    pub async fn shutdown(self) {
        let _ = self.handle.submit(Command::Shutdown);
        if let Err(e) = self.task.await {
            warn!("dispatcher task ended abnormally: {}", e);
        }
    }
}

// ── Dispatcher ────────────────────────────────────────────────────────────────

pub struct Dispatcher {
    timeline: Timeline,
    machine: StateMachine,
    watchers: WatcherRegistry,
    player: SharedController,
    catalog: Box<dyn Catalog>,
    sink: Box<dyn PresentationSink>,
    store: Box<dyn SnapshotStore>,
    preference_source: Box<dyn PreferenceSource>,
    prefs: Preferences,
    guard: AwakeGuard,
    /// Loopback for commands the loop schedules for itself.  Weak, so the
    /// loop ends once every outside sender is dropped.
    tx: mpsc::WeakUnboundedSender<Command>,
    seed: u64,
    /// Ids the catalog reported on the last refresh.
    pool: Vec<TrackId>,
    pending_toggle: Option<Instant>,
    pending_checkpoint: Option<Instant>,
    /// Timeline revision last seen by the loop.
    seen_rev: u64,
    pending_seek_ms: u32,
    playing_before_call: bool,
    headset_plugged: bool,
}

impl Dispatcher {
    pub fn new(setup: Setup) -> (Self, mpsc::UnboundedReceiver<Command>) {
        let dispatcher = Self {
            timeline: Timeline::new(setup.seed),
            machine: StateMachine::default(),
            watchers: WatcherRegistry::new(),
            player: setup.player,
            catalog: setup.catalog,
            sink: setup.sink,
            store: setup.store,
            preference_source: setup.preference_source,
            prefs: setup.preferences,
            guard: setup.guard,
            tx: setup.tx.downgrade(),
            seed: setup.seed,
            pool: Vec::new(),
            pending_toggle: None,
            pending_checkpoint: None,
            seen_rev: 0,
            pending_seek_ms: 0,
            playing_before_call: false,
            headset_plugged: false,
        };
        (dispatcher, setup.rx)
    }

    /// Restore or build the timeline, load the current track, then process
    /// commands until `Shutdown` or until every sender is gone.
    pub async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command>) {
        self.init();
        info!("dispatcher: starting event loop");

        loop {
            let deadline = self.next_deadline();
            tokio::select! {
                cmd = rx.recv() => match cmd {
                    None => {
                        info!("dispatcher: command channel closed, shutting down");
                        break;
                    }
                    Some(Command::Shutdown) => {
                        info!("dispatcher: shutdown requested");
                        break;
                    }
                    Some(cmd) => {
                        debug!("dispatcher: {:?}", cmd);
                        self.handle(cmd);
                    }
                },
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.fire_due();
                }
            }
            self.note_mutations();
        }

        self.teardown();
    }

    fn init(&mut self) {
        let restored = persist::load(self.store.as_mut()).and_then(|snapshot| {
            let timeline = Timeline::restore(snapshot.timeline()?, self.seed)?;
            Some((timeline, snapshot.pending_seek_ms))
        });
        match restored {
            Some((timeline, seek)) => {
                info!(
                    "dispatcher: restored {} tracks, cursor {}",
                    timeline.len(),
                    timeline.cursor()
                );
                self.timeline = timeline;
                self.pending_seek_ms = seek.max(0) as u32;
            }
            None => info!("dispatcher: starting with a fresh timeline"),
        }
        self.seen_rev = self.timeline.rev();

        self.refresh_catalog();
        self.set_current_song(0);
        self.watchers.mark_loaded();
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::PreferenceChanged(key) => self.preference_changed(&key),
            Command::QueueItem(QueueRequest::Track(id)) => {
                let pos = self.timeline.insert_at_queue_slot(id);
                info!("dispatcher: enqueued {} at position {}", id, pos);
            }
            Command::QueueItem(QueueRequest::Reset) => self.timeline.reset_queue_slot(),
            Command::TrackAdvance => self.set_current_song(1),
            Command::ReleaseGuard => {
                self.guard.release();
            }
            Command::CatalogRefresh => self.refresh_catalog(),
            Command::CallInterrupt(in_call) => self.call_interrupt(in_call),
            Command::HeadsetChanged(plugged) => self.headset_changed(plugged),
            Command::TogglePlayOrSkip(0) => {
                if self.pending_toggle.is_some() {
                    debug!("dispatcher: replacing pending toggle");
                }
                self.pending_toggle = Some(Instant::now() + TOGGLE_DEBOUNCE);
            }
            Command::TogglePlayOrSkip(delta) => self.set_current_song(delta),
            Command::SetState(state) => self.set_state(state),
            Command::Checkpoint => self.schedule_checkpoint(),
            Command::WindowMaintenance => {
                self.timeline.track_at(2, &self.pool);
                self.timeline.evict_if_over_threshold();
                self.schedule_checkpoint();
            }
            Command::SeekToProgress(permille) => self.seek_to_progress(permille),
            Command::PresentationRefresh => self.refresh_presentation(),
            Command::Register(id, watcher) => self.watchers.register(id, watcher),
            Command::Unregister(id) => {
                self.watchers.unregister(id);
            }
            Command::SongQuery(delta, reply) => {
                let track = self.track_at(delta);
                let _ = reply.send(track);
            }
            Command::StatusQuery(reply) => {
                let _ = reply.send(self.status());
            }
            Command::Shutdown => {}
        }
    }

    // ── debounced work ────────────────────────────────────────────────────────

    fn next_deadline(&self) -> Option<Instant> {
        match (self.pending_toggle, self.pending_checkpoint) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    fn fire_due(&mut self) {
        let now = Instant::now();
        if self.pending_toggle.is_some_and(|at| at <= now) {
            self.pending_toggle = None;
            self.toggle();
        }
        if self.pending_checkpoint.is_some_and(|at| at <= now) {
            self.pending_checkpoint = None;
            self.write_checkpoint(0);
        }
    }

    fn schedule_checkpoint(&mut self) {
        self.pending_checkpoint = Some(Instant::now() + CHECKPOINT_DELAY);
    }

    /// Any timeline mutation pushes the checkpoint back.
    fn note_mutations(&mut self) {
        let rev = self.timeline.rev();
        if rev != self.seen_rev {
            self.seen_rev = rev;
            self.schedule_checkpoint();
        }
    }

    fn write_checkpoint(&mut self, pending_seek_ms: i32) {
        let snapshot = Snapshot::from_timeline(&self.timeline.snapshot(), pending_seek_ms);
        persist::save(self.store.as_mut(), &snapshot);
    }

    // ── playback ──────────────────────────────────────────────────────────────

    fn toggle(&mut self) {
        match self.machine.current() {
            PlaybackState::NoMedia => debug!("dispatcher: toggle ignored, nothing to play"),
            PlaybackState::Playing => self.set_state(PlaybackState::Paused),
            PlaybackState::Paused => self.set_state(PlaybackState::Playing),
        }
    }

    /// Move the cursor by `delta` and load the new current track.  A load
    /// failure moves on to the next track.
    fn set_current_song(&mut self, delta: i32) {
        if self.machine.current() == PlaybackState::NoMedia {
            debug!("dispatcher: no media, not changing track");
            return;
        }
        let Some(id) = self.timeline.advance(delta, &self.pool) else {
            debug!("dispatcher: no track at {:+}", delta);
            return;
        };
        let track = self.resolve(id);

        // A restored position belongs to the first track loaded, and only to it.
        let seek = std::mem::take(&mut self.pending_seek_ms);
        let playing = self.machine.is_playing();
        let result = {
            let mut player = lock(&self.player);
            player.load(&track).and_then(|()| {
                if seek > 0 {
                    if let Err(e) = player.seek_ms(seek) {
                        warn!("dispatcher: failed to restore position {}ms: {}", seek, e);
                    }
                }
                if playing {
                    player.start()
                } else {
                    Ok(())
                }
            })
        };
        match result {
            Ok(()) => info!("dispatcher: now at {}", track.display_name()),
            Err(e) => {
                warn!("dispatcher: {}; skipping", e);
                self.enqueue(Command::TrackAdvance);
            }
        }

        self.update_state(self.machine.current());
        self.enqueue(Command::WindowMaintenance);
    }

    /// Run the entry action for `next`, then record the state.
    fn set_state(&mut self, next: PlaybackState) {
        if next != PlaybackState::NoMedia
            && (self.machine.current() == PlaybackState::NoMedia
                || self.pool.is_empty()
                || self.timeline.current().is_none())
        {
            debug!("dispatcher: {} ignored, nothing to play", next);
            return;
        }
        match next.entry_action() {
            EntryAction::StartForeground => {
                if self.prefs.headset_only && self.speaker_on() {
                    info!("dispatcher: not playing through the speaker");
                    return;
                }
                if let Err(e) = lock(&self.player).start() {
                    warn!("dispatcher: failed to start playback: {}", e);
                    return;
                }
                self.sink.set_foreground(true);
            }
            EntryAction::PauseBackground => {
                if let Err(e) = lock(&self.player).pause() {
                    warn!("dispatcher: failed to pause playback: {}", e);
                }
                self.sink.set_foreground(false);
            }
            EntryAction::ClearPresentation => {
                let mut player = lock(&self.player);
                if player.is_playing() {
                    if let Err(e) = player.pause() {
                        warn!("dispatcher: failed to pause playback: {}", e);
                    }
                }
                drop(player);
                self.sink.set_foreground(false);
            }
        }
        self.update_state(next);
    }

    /// Record `next`, tell watchers if it changed, re-announce the current
    /// track and refresh the presentation.
    fn update_state(&mut self, next: PlaybackState) {
        if let Some(change) = self.machine.transition(next) {
            info!("dispatcher: state {} → {}", change.old, change.new);
            self.watchers.broadcast_state(change);
        }
        let track = self.track_at(0);
        self.watchers.broadcast_song(track.as_ref());
        self.refresh_presentation();
    }

    fn refresh_presentation(&mut self) {
        let state = self.machine.current();
        let track = self.timeline.current().map(|id| self.resolve(id));
        let hide = state == PlaybackState::NoMedia
            || (state == PlaybackState::Paused && !self.prefs.notify_while_paused);
        match track {
            Some(track) if !hide => self.sink.render(Some(&track), state),
            _ => self.sink.clear(),
        }
    }

    fn seek_to_progress(&mut self, permille: u32) {
        let mut player = lock(&self.player);
        if !player.is_playing() {
            return;
        }
        let position = player.duration_ms() as u64 * permille.min(1000) as u64 / 1000;
        if let Err(e) = player.seek_ms(position as u32) {
            warn!("dispatcher: seek failed: {}", e);
        }
    }

    // ── interruptions ─────────────────────────────────────────────────────────

    fn speaker_on(&self) -> bool {
        !self.headset_plugged
    }

    fn headset_changed(&mut self, plugged: bool) {
        let was = std::mem::replace(&mut self.headset_plugged, plugged);
        if plugged == was || !self.machine.is_playing() {
            return;
        }
        if (self.prefs.headset_pause && !plugged) || (self.prefs.headset_only && self.speaker_on())
        {
            info!("dispatcher: headset unplugged, pausing");
            self.set_state(PlaybackState::Paused);
        }
    }

    fn call_interrupt(&mut self, in_call: bool) {
        if in_call {
            if self.machine.is_playing() {
                info!("dispatcher: call started, pausing");
                self.playing_before_call = true;
                self.set_state(PlaybackState::Paused);
            }
        } else if std::mem::take(&mut self.playing_before_call) {
            info!("dispatcher: call ended, resuming");
            self.set_state(PlaybackState::Playing);
        }
    }

    fn preference_changed(&mut self, key: &str) {
        let key: PreferenceKey = match key.parse() {
            Ok(k) => k,
            Err(e) => {
                debug!("dispatcher: {}", e);
                return;
            }
        };
        let fresh = match self.preference_source.load() {
            Ok(p) => p,
            Err(e) => {
                warn!("dispatcher: failed to reload preferences: {}", e);
                return;
            }
        };
        if !self.prefs.apply(key, &fresh) {
            return;
        }
        info!("dispatcher: preference {:?} updated", key);
        match key {
            PreferenceKey::HeadsetOnly => {
                if self.prefs.headset_only && self.speaker_on() && self.machine.is_playing() {
                    self.set_state(PlaybackState::Paused);
                }
            }
            PreferenceKey::NotifyWhilePaused => self.refresh_presentation(),
            PreferenceKey::HeadsetPause => {}
        }
    }

    // ── catalog ───────────────────────────────────────────────────────────────

    fn refresh_catalog(&mut self) {
        match self.catalog.all_track_ids() {
            Ok(ids) => {
                info!("dispatcher: catalog has {} tracks", ids.len());
                self.pool = ids;
            }
            Err(e) => warn!("dispatcher: catalog refresh failed, keeping {} tracks: {}", self.pool.len(), e),
        }

        if self.pool.is_empty() {
            self.set_state(PlaybackState::NoMedia);
        } else if self.machine.current() == PlaybackState::NoMedia {
            self.update_state(PlaybackState::Paused);
            self.set_current_song(0);
        }
    }

    fn resolve(&self, id: TrackId) -> Track {
        Track::with_info(id, self.catalog.resolve(id))
    }

    fn track_at(&mut self, delta: i32) -> Option<Track> {
        let id = self.timeline.track_at(delta, &self.pool)?;
        Some(self.resolve(id))
    }

    fn status(&self) -> Status {
        Status {
            state: self.machine.current(),
            current: self.timeline.current().map(|id| self.resolve(id)),
            cursor: self.timeline.cursor(),
            timeline_len: self.timeline.len(),
            queue_slot: self.timeline.queue_slot(),
        }
    }

    fn enqueue(&self, cmd: Command) {
        match self.tx.upgrade() {
            Some(tx) => {
                let _ = tx.send(cmd);
            }
            None => debug!("dispatcher: no senders left, dropping {:?}", cmd),
        }
    }

    fn teardown(&mut self) {
        self.pending_toggle = None;
        self.pending_checkpoint = None;
        let position = lock(&self.player).position_ms();
        self.write_checkpoint(position.min(i32::MAX as u32) as i32);

        {
            let mut player = lock(&self.player);
            if player.is_playing() {
                if let Err(e) = player.pause() {
                    warn!("dispatcher: failed to pause on shutdown: {}", e);
                }
            }
        }
        self.sink.set_foreground(false);
        self.sink.clear();
        self.guard.release();
        info!("dispatcher: stopped");
    }
}

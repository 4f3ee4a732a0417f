//! Interfaces to the world outside the playback core: the audio backend, the
//! track catalog and whatever shows "now playing" to the user.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::dispatcher::Command;
use crate::error::Result;
use crate::state::PlaybackState;
use crate::track::{Track, TrackId, TrackInfo};

/// Audio backend.  Calls are expected to return quickly; slow work belongs in
/// the backend's own tasks, which report back through [`PlaybackSignals`].
pub trait PlaybackController: Send {
    /// Replace whatever is loaded with `track`, paused at the start.
    fn load(&mut self, track: &Track) -> Result<()>;
    fn start(&mut self) -> Result<()>;
    fn pause(&mut self) -> Result<()>;
    fn seek_ms(&mut self, position_ms: u32) -> Result<()>;
    fn position_ms(&self) -> u32;
    fn duration_ms(&self) -> u32;
    fn is_playing(&self) -> bool;
}

/// Source of track ids and their metadata.
pub trait Catalog: Send {
    /// Every id currently available.  May be empty.
    fn all_track_ids(&mut self) -> Result<Vec<TrackId>>;
    /// Metadata for one id, `None` if the catalog no longer knows it.
    fn resolve(&self, id: TrackId) -> Option<TrackInfo>;
}

/// Notification / widget style "now playing" surface.
pub trait PresentationSink: Send {
    fn render(&mut self, track: Option<&Track>, state: PlaybackState);
    fn clear(&mut self);
    /// Foreground while playing, background otherwise.
    fn set_foreground(&mut self, _foreground: bool) {}
}

/// Held between a track finishing and the next one being loaded, so the host
/// does not suspend the process in between.
#[derive(Debug, Clone, Default)]
pub struct AwakeGuard {
    held: Arc<AtomicBool>,
}

impl AwakeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) {
        if !self.held.swap(true, Ordering::AcqRel) {
            debug!("awake guard acquired");
        }
    }

    /// Returns whether the guard was held.
    pub fn release(&self) -> bool {
        let was = self.held.swap(false, Ordering::AcqRel);
        if was {
            debug!("awake guard released");
        }
        was
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

/// Completion / error callbacks handed to a playback backend at construction.
/// Both end up as a `TrackAdvance` on the dispatcher queue.
#[derive(Clone)]
pub struct PlaybackSignals {
    tx: mpsc::UnboundedSender<Command>,
    guard: AwakeGuard,
}

impl PlaybackSignals {
    pub fn new(tx: mpsc::UnboundedSender<Command>, guard: AwakeGuard) -> Self {
        Self { tx, guard }
    }

    /// The loaded track played to the end.
    pub fn completed(&self) {
        self.guard.acquire();
        let _ = self.tx.send(Command::TrackAdvance);
        let _ = self.tx.send(Command::ReleaseGuard);
    }

    /// The backend gave up on the loaded track.
    pub fn failed(&self, reason: &str) {
        error!("playback error: {}", reason);
        let _ = self.tx.send(Command::TrackAdvance);
    }
}

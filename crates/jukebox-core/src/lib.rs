//! Playback core for the jukebox daemon: the play timeline, the playback
//! state machine, watcher fan-out, checkpointing and the command dispatcher
//! that owns all of them.

pub mod collab;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod persist;
pub mod platform;
pub mod prefs;
pub mod protocol;
pub mod state;
pub mod timeline;
pub mod track;
pub mod watchers;

pub use dispatcher::{Command, PlayerHandle, Service, Setup};
pub use error::{Error, Result};
pub use state::PlaybackState;
pub use track::{Track, TrackId, TrackInfo};

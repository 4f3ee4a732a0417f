use thiserror::Error;

use crate::track::TrackId;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The playback backend refused or failed to load a track.
    #[error("Failed to load track {track}: {reason}")]
    Load { track: TrackId, reason: String },

    /// Any other playback backend failure (start/pause/seek).
    #[error("Playback error: {0}")]
    Playback(String),

    #[error("Catalog error: {0}")]
    Catalog(String),

    /// A protocol frame was incomplete or malformed.
    #[error("Frame error: {0}")]
    Frame(String),

    /// The dispatcher loop has exited and no longer accepts commands.
    #[error("Dispatcher is not running")]
    DispatcherGone,
}

/// Returned by a watcher when a notification could not be delivered.
/// The registry drops the watcher on the first such failure.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("watcher is gone")]
pub struct WatcherGone;

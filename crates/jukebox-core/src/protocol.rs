use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::state::PlaybackState;
use crate::track::{Track, TrackId};
use crate::watchers::WatcherEvent;

/// Current protocol version.  Bump this when the wire format changes in a
/// breaking way.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame body.
pub const MAX_FRAME_LEN: usize = 1 << 20;

/// Requests from a remote client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd")]
pub enum Request {
    /// Track at `delta` relative to the current one.
    GetSong { delta: i32 },
    GetStatus,
    /// Position and duration of the loaded track, answered without queueing.
    GetPosition,
    TogglePlayback,
    Skip { delta: i32 },
    /// Seek to `permille`/1000 of the current track.
    SeekToProgress { permille: u32 },
    /// Play `id` after whatever is already queued.
    Enqueue { id: TrackId },
    /// Start queueing right after the current track again.
    ResetQueue,
    CatalogChanged,
    HeadsetChanged { plugged: bool },
    CallStateChanged { in_call: bool },
    PreferenceChanged { key: String },
    RefreshPresentation,
}

/// Snapshot of the player for status replies.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Status {
    pub state: PlaybackState,
    pub current: Option<Track>,
    pub cursor: usize,
    pub timeline_len: usize,
    pub queue_slot: usize,
}

/// Messages from the daemon to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "broadcast")]
pub enum Broadcast {
    /// Sent immediately on connect.
    Hello {
        protocol_version: u32,
        status: Status,
    },
    /// A watcher notification.
    Event { event: WatcherEvent },
    Song { delta: i32, track: Option<Track> },
    Status { data: Status },
    Position { position_ms: u32, duration_ms: u32 },
    Log { message: String },
    Error { message: String },
}

/// Wrapper for socket communication
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Message {
    Request(Request),
    Broadcast(Broadcast),
}

impl Message {
    /// 4-byte big-endian length followed by the JSON body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let json = serde_json::to_vec(self)?;
        let len = json.len() as u32;
        let mut result = Vec::with_capacity(4 + json.len());
        result.extend_from_slice(&len.to_be_bytes());
        result.extend_from_slice(&json);
        Ok(result)
    }

    /// Decode one frame from the front of `data`.  `Ok(None)` means more
    /// bytes are needed; the `usize` is how many bytes the frame used.
    pub fn decode(data: &[u8]) -> Result<Option<(Self, usize)>> {
        if data.len() < 4 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;
        if len > MAX_FRAME_LEN {
            return Err(Error::Frame(format!("frame of {} bytes exceeds limit", len)));
        }
        if data.len() < 4 + len {
            return Ok(None);
        }
        let msg: Self = serde_json::from_slice(&data[4..4 + len])?;
        Ok(Some((msg, 4 + len)))
    }
}

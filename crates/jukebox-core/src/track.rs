use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque catalog identifier.  Stored as a signed 32-bit value because that is
/// what the snapshot file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrackId(pub i32);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i32> for TrackId {
    fn from(id: i32) -> Self {
        TrackId(id)
    }
}

/// Metadata the catalog resolves for an id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrackInfo {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub artist: String,
    /// Path or URL the playback backend loads.
    #[serde(default)]
    pub location: String,
}

/// A timeline entry with whatever metadata the catalog had for it.
///
/// Two tracks are equal when their ids are equal; metadata is informational.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Track {
    pub id: TrackId,
    #[serde(flatten)]
    pub info: TrackInfo,
}

impl Track {
    /// A track whose metadata has not been resolved (or is unknown to the catalog).
    pub fn bare(id: TrackId) -> Self {
        Self {
            id,
            info: TrackInfo::default(),
        }
    }

    pub fn with_info(id: TrackId, info: Option<TrackInfo>) -> Self {
        Self {
            id,
            info: info.unwrap_or_default(),
        }
    }

    /// "Artist - Title", falling back to whatever is known.
    pub fn display_name(&self) -> String {
        match (self.info.artist.is_empty(), self.info.title.is_empty()) {
            (false, false) => format!("{} - {}", self.info.artist, self.info.title),
            (true, false) => self.info.title.clone(),
            (false, true) => format!("{} - #{}", self.info.artist, self.id),
            (true, true) => format!("#{}", self.id),
        }
    }
}

impl PartialEq for Track {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Track {}

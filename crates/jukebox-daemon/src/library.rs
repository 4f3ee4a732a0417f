//! Track catalog backed by a TOML listing:
//!
//! ```toml
//! [[track]]
//! id = 1
//! title = "Blue in Green"
//! artist = "Miles Davis"
//! path = "jazz/blue-in-green.flac"
//! ```
//!
//! Relative paths are taken relative to the listing file.  The file is
//! re-read on every catalog refresh; a missing file is an empty catalog.

use jukebox_core::collab::Catalog;
use jukebox_core::{Error, TrackId, TrackInfo};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Matches one `[[track]]` table.  Kept apart from `TrackInfo` so the file
/// format can change without touching the wire types.
#[derive(Debug, serde::Deserialize)]
struct TomlLibraryFile {
    #[serde(default)]
    track: Vec<TomlTrack>,
}

#[derive(Debug, serde::Deserialize)]
struct TomlTrack {
    id: i32,
    #[serde(default)]
    title: String,
    #[serde(default)]
    artist: String,
    path: String,
}

pub fn parse_library_from_toml_str(
    content: &str,
    base_dir: &Path,
) -> anyhow::Result<BTreeMap<TrackId, TrackInfo>> {
    let file: TomlLibraryFile = toml::from_str(content)?;
    let mut tracks = BTreeMap::new();
    for t in file.track {
        let location = if t.path.contains("://") || Path::new(&t.path).is_absolute() {
            t.path
        } else {
            base_dir.join(&t.path).to_string_lossy().into_owned()
        };
        let info = TrackInfo {
            title: t.title,
            artist: t.artist,
            location,
        };
        if tracks.insert(TrackId(t.id), info).is_some() {
            warn!("library: duplicate track id {}, keeping the last one", t.id);
        }
    }
    Ok(tracks)
}

pub struct TomlCatalog {
    path: PathBuf,
    tracks: BTreeMap<TrackId, TrackInfo>,
}

impl TomlCatalog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tracks: BTreeMap::new(),
        }
    }

    fn reload(&mut self) -> anyhow::Result<()> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("library: {:?} not found, catalog is empty", self.path);
                self.tracks.clear();
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };
        let base_dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        self.tracks = parse_library_from_toml_str(&content, base_dir)?;
        Ok(())
    }
}

impl Catalog for TomlCatalog {
    fn all_track_ids(&mut self) -> jukebox_core::Result<Vec<TrackId>> {
        self.reload()
            .map_err(|e| Error::Catalog(format!("{}: {}", self.path.display(), e)))?;
        Ok(self.tracks.keys().copied().collect())
    }

    fn resolve(&self, id: TrackId) -> Option<TrackInfo> {
        self.tracks.get(&id).cloned()
    }
}

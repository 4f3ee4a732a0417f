//! In-memory collaborators for exercising the servers without mpv.

use jukebox_core::collab::{AwakeGuard, Catalog, PlaybackController, PresentationSink};
use jukebox_core::dispatcher::{self, Service, Setup, SharedController};
use jukebox_core::persist::SnapshotStore;
use jukebox_core::prefs::Preferences;
use jukebox_core::{PlaybackState, Track, TrackId, TrackInfo};
use std::sync::{Arc, Mutex};

#[derive(Default)]
pub struct SilentPlayer {
    pub playing: bool,
    pub position_ms: u32,
}

impl PlaybackController for SilentPlayer {
    fn load(&mut self, _track: &Track) -> jukebox_core::Result<()> {
        self.playing = false;
        self.position_ms = 0;
        Ok(())
    }

    fn start(&mut self) -> jukebox_core::Result<()> {
        self.playing = true;
        Ok(())
    }

    fn pause(&mut self) -> jukebox_core::Result<()> {
        self.playing = false;
        Ok(())
    }

    fn seek_ms(&mut self, position_ms: u32) -> jukebox_core::Result<()> {
        self.position_ms = position_ms;
        Ok(())
    }

    fn position_ms(&self) -> u32 {
        self.position_ms
    }

    fn duration_ms(&self) -> u32 {
        180_000
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}

struct NumberedCatalog(Vec<TrackId>);

impl Catalog for NumberedCatalog {
    fn all_track_ids(&mut self) -> jukebox_core::Result<Vec<TrackId>> {
        Ok(self.0.clone())
    }

    fn resolve(&self, id: TrackId) -> Option<TrackInfo> {
        self.0.contains(&id).then(|| TrackInfo {
            title: format!("Song {}", id),
            artist: "Band".into(),
            location: format!("/music/{}.flac", id),
        })
    }
}

struct NullSink;

impl PresentationSink for NullSink {
    fn render(&mut self, _track: Option<&Track>, _state: PlaybackState) {}
    fn clear(&mut self) {}
}

#[derive(Default)]
struct NullStore;

impl SnapshotStore for NullStore {
    fn read(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn write(&mut self, _bytes: &[u8]) -> std::io::Result<()> {
        Ok(())
    }
}

/// Start a dispatcher over tracks `1..=count`.
pub fn start_service(count: i32) -> (Service, Arc<Mutex<SilentPlayer>>) {
    let player = Arc::new(Mutex::new(SilentPlayer::default()));
    let shared: SharedController = player.clone();
    let (tx, rx) = dispatcher::channel();
    let service = Service::start(Setup {
        tx,
        rx,
        player: shared,
        catalog: Box::new(NumberedCatalog((1..=count).map(TrackId).collect())),
        sink: Box::new(NullSink),
        store: Box::new(NullStore),
        preference_source: Box::new(Arc::new(Mutex::new(Preferences::default()))),
        preferences: Preferences::default(),
        guard: AwakeGuard::new(),
        seed: 1,
    });
    (service, player)
}

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use jukebox_core::collab::{AwakeGuard, Catalog, PlaybackController, PlaybackSignals, PresentationSink};
use jukebox_core::dispatcher::{self, PlayerHandle, Service, Setup, SharedController};
use jukebox_core::persist::{self, Snapshot, SnapshotStore};
use jukebox_core::prefs::Preferences;
use jukebox_core::{Error, PlaybackState, Result, Track, TrackId, TrackInfo};

pub const SEED: u64 = 7;

pub fn ids(raw: &[i32]) -> Vec<TrackId> {
    raw.iter().copied().map(TrackId).collect()
}

// ── fakes ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct FakePlayer {
    /// Every load attempt, failed ones included.
    pub loads: Vec<TrackId>,
    pub starts: usize,
    pub pauses: usize,
    pub seeks: Vec<u32>,
    pub playing: bool,
    pub position_ms: u32,
    pub duration_ms: u32,
    pub failing: HashSet<TrackId>,
}

impl PlaybackController for FakePlayer {
    fn load(&mut self, track: &Track) -> Result<()> {
        self.loads.push(track.id);
        self.playing = false;
        if self.failing.contains(&track.id) {
            return Err(Error::Load {
                track: track.id,
                reason: "unsupported format".into(),
            });
        }
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.starts += 1;
        self.playing = true;
        Ok(())
    }

    fn pause(&mut self) -> Result<()> {
        self.pauses += 1;
        self.playing = false;
        Ok(())
    }

    fn seek_ms(&mut self, position_ms: u32) -> Result<()> {
        self.seeks.push(position_ms);
        self.position_ms = position_ms;
        Ok(())
    }

    fn position_ms(&self) -> u32 {
        self.position_ms
    }

    fn duration_ms(&self) -> u32 {
        self.duration_ms
    }

    fn is_playing(&self) -> bool {
        self.playing
    }
}

/// Catalog over a shared id list; every id resolves to a made-up title.
pub struct StaticCatalog {
    ids: Arc<Mutex<Vec<TrackId>>>,
}

impl Catalog for StaticCatalog {
    fn all_track_ids(&mut self) -> Result<Vec<TrackId>> {
        Ok(self.ids.lock().unwrap().clone())
    }

    fn resolve(&self, id: TrackId) -> Option<TrackInfo> {
        Some(TrackInfo {
            title: format!("Track {}", id),
            artist: "Test Artist".into(),
            location: format!("/music/{}.mp3", id),
        })
    }
}

#[derive(Debug, Default)]
pub struct SinkLog {
    pub renders: Vec<(Option<TrackId>, PlaybackState)>,
    pub clears: usize,
    pub foreground: bool,
}

pub struct RecordingSink(Arc<Mutex<SinkLog>>);

impl PresentationSink for RecordingSink {
    fn render(&mut self, track: Option<&Track>, state: PlaybackState) {
        self.0.lock().unwrap().renders.push((track.map(|t| t.id), state));
    }

    fn clear(&mut self) {
        self.0.lock().unwrap().clears += 1;
    }

    fn set_foreground(&mut self, foreground: bool) {
        self.0.lock().unwrap().foreground = foreground;
    }
}

#[derive(Debug, Default)]
pub struct StoreLog {
    pub bytes: Option<Vec<u8>>,
    pub writes: usize,
}

impl StoreLog {
    pub fn snapshot(&self) -> Option<Snapshot> {
        persist::decode(self.bytes.as_deref()?)
    }
}

pub struct MemoryStore(Arc<Mutex<StoreLog>>);

impl SnapshotStore for MemoryStore {
    fn read(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        Ok(self.0.lock().unwrap().bytes.clone())
    }

    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        let mut log = self.0.lock().unwrap();
        log.bytes = Some(bytes.to_vec());
        log.writes += 1;
        Ok(())
    }
}

// ── harness ───────────────────────────────────────────────────────────────────

/// What the service starts from.
#[derive(Default)]
pub struct Fixture {
    pub catalog: Vec<i32>,
    pub snapshot: Option<Snapshot>,
    pub failing: Vec<i32>,
    pub prefs: Preferences,
}

pub struct Harness {
    pub service: Service,
    pub handle: PlayerHandle,
    pub player: Arc<Mutex<FakePlayer>>,
    pub catalog: Arc<Mutex<Vec<TrackId>>>,
    pub sink: Arc<Mutex<SinkLog>>,
    pub store: Arc<Mutex<StoreLog>>,
    pub prefs: Arc<Mutex<Preferences>>,
    pub guard: AwakeGuard,
    pub signals: PlaybackSignals,
}

impl Fixture {
    pub fn with_catalog(raw: &[i32]) -> Self {
        Self {
            catalog: raw.to_vec(),
            ..Self::default()
        }
    }

    pub fn start(self) -> Harness {
        let player = Arc::new(Mutex::new(FakePlayer {
            failing: ids(&self.failing).into_iter().collect(),
            duration_ms: 200_000,
            ..FakePlayer::default()
        }));
        let catalog = Arc::new(Mutex::new(ids(&self.catalog)));
        let sink = Arc::new(Mutex::new(SinkLog::default()));
        let store = Arc::new(Mutex::new(StoreLog {
            bytes: self.snapshot.as_ref().map(persist::encode),
            writes: 0,
        }));
        let prefs = Arc::new(Mutex::new(self.prefs));

        let (tx, rx) = dispatcher::channel();
        let guard = AwakeGuard::new();
        let signals = PlaybackSignals::new(tx.clone(), guard.clone());
        let shared: SharedController = player.clone();

        let service = Service::start(Setup {
            tx,
            rx,
            player: shared,
            catalog: Box::new(StaticCatalog {
                ids: catalog.clone(),
            }),
            sink: Box::new(RecordingSink(sink.clone())),
            store: Box::new(MemoryStore(store.clone())),
            preference_source: Box::new(prefs.clone()),
            preferences: self.prefs,
            guard: guard.clone(),
            seed: SEED,
        });
        let handle = service.handle();

        Harness {
            service,
            handle,
            player,
            catalog,
            sink,
            store,
            prefs,
            guard,
            signals,
        }
    }
}

impl Harness {
    /// Round-trip through the queue a few times so follow-up commands the
    /// dispatcher queued for itself have run too.
    pub async fn settle(&self) {
        for _ in 0..5 {
            self.handle.status().await.unwrap();
        }
    }

    pub async fn state(&self) -> PlaybackState {
        self.handle.status().await.unwrap().state
    }

    pub async fn current(&self) -> Option<TrackId> {
        self.handle.status().await.unwrap().current.map(|t| t.id)
    }

    pub fn writes(&self) -> usize {
        self.store.lock().unwrap().writes
    }

    pub fn set_playing_position(&self, position_ms: u32) {
        self.player.lock().unwrap().position_ms = position_ms;
    }
}

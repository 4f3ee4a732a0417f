//! Multicast registry of observers.
//!
//! Every delivery is attempted independently per watcher.  A watcher that
//! fails once is dropped on the spot; the caller of the broadcast never sees
//! the failure.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::error::WatcherGone;
use crate::state::{PlaybackState, StateChange};
use crate::track::{Track, TrackId};

static NEXT_WATCHER_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque per-observer handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WatcherId(u64);

impl WatcherId {
    pub fn next() -> Self {
        WatcherId(NEXT_WATCHER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

pub trait Watcher: Send {
    fn loaded(&self) -> Result<(), WatcherGone>;
    fn state_changed(&self, old: PlaybackState, new: PlaybackState) -> Result<(), WatcherGone>;
    fn song_changed(&self, track: Option<&Track>) -> Result<(), WatcherGone>;
}

/// Notification as seen by channel-backed watchers (socket clients).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum WatcherEvent {
    Loaded,
    StateChanged {
        old: PlaybackState,
        new: PlaybackState,
    },
    SongChanged {
        track: Option<Track>,
    },
}

/// Watcher that forwards into an unbounded channel.  Delivery fails once the
/// receiving side has been dropped.
pub struct ChannelWatcher {
    tx: mpsc::UnboundedSender<WatcherEvent>,
}

impl ChannelWatcher {
    pub fn new(tx: mpsc::UnboundedSender<WatcherEvent>) -> Self {
        Self { tx }
    }

    pub fn pair() -> (Self, mpsc::UnboundedReceiver<WatcherEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn deliver(&self, event: WatcherEvent) -> Result<(), WatcherGone> {
        self.tx.send(event).map_err(|_| WatcherGone)
    }
}

impl Watcher for ChannelWatcher {
    fn loaded(&self) -> Result<(), WatcherGone> {
        self.deliver(WatcherEvent::Loaded)
    }

    fn state_changed(&self, old: PlaybackState, new: PlaybackState) -> Result<(), WatcherGone> {
        self.deliver(WatcherEvent::StateChanged { old, new })
    }

    fn song_changed(&self, track: Option<&Track>) -> Result<(), WatcherGone> {
        self.deliver(WatcherEvent::SongChanged {
            track: track.cloned(),
        })
    }
}

#[derive(Default)]
pub struct WatcherRegistry {
    watchers: BTreeMap<WatcherId, Box<dyn Watcher>>,
    loaded: bool,
    /// Last track sent through `broadcast_song`, for dedup.
    last_song: Option<TrackId>,
}

impl WatcherRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.watchers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watchers.is_empty()
    }

    pub fn contains(&self, id: WatcherId) -> bool {
        self.watchers.contains_key(&id)
    }

    /// Attach a watcher.  If the initial load already finished it gets
    /// `loaded()` straight away; failing that first delivery means it is
    /// never attached.
    pub fn register(&mut self, id: WatcherId, watcher: Box<dyn Watcher>) {
        if self.loaded && watcher.loaded().is_err() {
            debug!("watchers: {:?} gone before registration", id);
            return;
        }
        self.watchers.insert(id, watcher);
        info!("watchers: registered {:?} ({} total)", id, self.watchers.len());
    }

    pub fn unregister(&mut self, id: WatcherId) -> bool {
        let removed = self.watchers.remove(&id).is_some();
        if removed {
            info!("watchers: unregistered {:?} ({} total)", id, self.watchers.len());
        }
        removed
    }

    /// Record that the initial load completed and tell everyone attached.
    pub fn mark_loaded(&mut self) {
        self.loaded = true;
        self.broadcast(|w| w.loaded());
    }

    pub fn broadcast_state(&mut self, change: StateChange) {
        self.broadcast(|w| w.state_changed(change.old, change.new));
    }

    /// Announce the current track unless it is the one announced last.
    /// Returns whether a broadcast went out.
    pub fn broadcast_song(&mut self, track: Option<&Track>) -> bool {
        let id = track.map(|t| t.id);
        if id == self.last_song {
            return false;
        }
        self.last_song = id;
        self.broadcast(|w| w.song_changed(track));
        true
    }

    fn broadcast<F>(&mut self, deliver: F)
    where
        F: Fn(&dyn Watcher) -> Result<(), WatcherGone>,
    {
        self.watchers.retain(|id, watcher| match deliver(watcher.as_ref()) {
            Ok(()) => true,
            Err(WatcherGone) => {
                debug!("watchers: dropping {:?} after failed delivery", id);
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Records what it receives; fails every delivery once `fail` is set.
    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<String>>>,
        fail: Arc<Mutex<bool>>,
    }

    impl Recorder {
        fn push(&self, s: String) -> Result<(), WatcherGone> {
            if *self.fail.lock().unwrap() {
                return Err(WatcherGone);
            }
            self.seen.lock().unwrap().push(s);
            Ok(())
        }

        fn seen(&self) -> Vec<String> {
            self.seen.lock().unwrap().clone()
        }
    }

    impl Watcher for Recorder {
        fn loaded(&self) -> Result<(), WatcherGone> {
            self.push("loaded".into())
        }
        fn state_changed(&self, old: PlaybackState, new: PlaybackState) -> Result<(), WatcherGone> {
            self.push(format!("{old}->{new}"))
        }
        fn song_changed(&self, track: Option<&Track>) -> Result<(), WatcherGone> {
            self.push(format!("song {:?}", track.map(|t| t.id.0)))
        }
    }

    #[test]
    fn test_register_after_load_gets_loaded() {
        let mut reg = WatcherRegistry::new();
        let early = Recorder::default();
        reg.register(WatcherId::next(), Box::new(early.clone()));
        assert!(early.seen().is_empty());

        reg.mark_loaded();
        assert_eq!(early.seen(), vec!["loaded"]);

        let late = Recorder::default();
        reg.register(WatcherId::next(), Box::new(late.clone()));
        assert_eq!(late.seen(), vec!["loaded"]);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn test_song_broadcast_dedup() {
        let mut reg = WatcherRegistry::new();
        let w = Recorder::default();
        reg.register(WatcherId::next(), Box::new(w.clone()));

        let t = Track::bare(TrackId(4));
        assert!(reg.broadcast_song(Some(&t)));
        assert!(!reg.broadcast_song(Some(&t)));
        assert!(reg.broadcast_song(Some(&Track::bare(TrackId(5)))));
        assert!(reg.broadcast_song(Some(&t)));
        assert_eq!(w.seen(), vec!["song Some(4)", "song Some(5)", "song Some(4)"]);
    }

    #[test]
    fn test_failed_delivery_removes_only_that_watcher() {
        let mut reg = WatcherRegistry::new();
        let good = Recorder::default();
        let bad = Recorder::default();
        let bad_id = WatcherId::next();
        reg.register(WatcherId::next(), Box::new(good.clone()));
        reg.register(bad_id, Box::new(bad.clone()));

        *bad.fail.lock().unwrap() = true;
        reg.broadcast_state(StateChange {
            old: PlaybackState::Paused,
            new: PlaybackState::Playing,
        });

        assert_eq!(reg.len(), 1);
        assert!(!reg.contains(bad_id));
        assert_eq!(good.seen(), vec!["paused->playing"]);

        // Recovery on the bad side does not bring it back.
        *bad.fail.lock().unwrap() = false;
        reg.broadcast_song(Some(&Track::bare(TrackId(1))));
        assert!(bad.seen().is_empty());
    }

    #[test]
    fn test_unregister() {
        let mut reg = WatcherRegistry::new();
        let id = WatcherId::next();
        reg.register(id, Box::new(Recorder::default()));
        assert!(reg.unregister(id));
        assert!(!reg.unregister(id));
        assert!(reg.is_empty());
    }

    #[test]
    fn test_channel_watcher_fails_after_receiver_drop() {
        let mut reg = WatcherRegistry::new();
        let (watcher, mut rx) = ChannelWatcher::pair();
        reg.register(WatcherId::next(), Box::new(watcher));
        reg.mark_loaded();
        assert_eq!(rx.try_recv().unwrap(), WatcherEvent::Loaded);

        drop(rx);
        reg.broadcast_song(Some(&Track::bare(TrackId(9))));
        assert!(reg.is_empty());
    }
}

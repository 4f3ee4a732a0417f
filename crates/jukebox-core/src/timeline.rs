//! Bounded, lazily extended timeline of tracks.
//!
//! Entries before the cursor are history, the entry at the cursor is the
//! current track and entries after it are the future.  The future is never
//! generated ahead of demand: asking for the position exactly one past the end
//! appends one track (an explicitly queued one if the queue placed something
//! there, otherwise a uniform random pick from the catalog); asking further out
//! returns nothing.
//!
//! History is capped: once the cursor passes [`HISTORY_LIMIT`] the oldest
//! entries are dropped and the cursor shifted down with them.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::debug;

use crate::track::TrackId;

/// Largest cursor value kept after eviction.
pub const HISTORY_LIMIT: usize = 15;

/// Cursor + entries, as persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineSnapshot {
    pub cursor: usize,
    pub entries: Vec<TrackId>,
}

pub struct Timeline {
    entries: Vec<TrackId>,
    cursor: usize,
    /// Next explicit-queue offset past the current track.  Only reset by
    /// [`Timeline::reset_queue_slot`].
    queue_slot: usize,
    /// Queued tracks at absolute positions not yet reached by the timeline.
    overlay: BTreeMap<usize, TrackId>,
    rng: StdRng,
    /// Bumped on every mutation so the owner can tell when to checkpoint.
    rev: u64,
}

impl Timeline {
    pub fn new(seed: u64) -> Self {
        Self {
            entries: Vec::new(),
            cursor: 0,
            queue_slot: 0,
            overlay: BTreeMap::new(),
            rng: StdRng::seed_from_u64(seed),
            rev: 0,
        }
    }

    /// Rebuild a timeline from a snapshot.  Returns `None` when the snapshot
    /// is empty or its cursor does not point at an entry.
    pub fn restore(snapshot: TimelineSnapshot, seed: u64) -> Option<Self> {
        if snapshot.entries.is_empty() || snapshot.cursor >= snapshot.entries.len() {
            return None;
        }
        let mut timeline = Self::new(seed);
        timeline.entries = snapshot.entries;
        timeline.cursor = snapshot.cursor;
        Some(timeline)
    }

    pub fn snapshot(&self) -> TimelineSnapshot {
        TimelineSnapshot {
            cursor: self.cursor,
            entries: self.entries.clone(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn entries(&self) -> &[TrackId] {
        &self.entries
    }

    pub fn rev(&self) -> u64 {
        self.rev
    }

    pub fn queue_slot(&self) -> usize {
        self.queue_slot
    }

    /// Current track without extending the timeline.
    pub fn current(&self) -> Option<TrackId> {
        self.entries.get(self.cursor).copied()
    }

    /// Track at `cursor + delta`.
    ///
    /// A position exactly one past the end is filled on demand from the queue
    /// overlay or, failing that, from `pool`.  Anything before the start or
    /// further past the end is `None` and leaves the timeline untouched, as
    /// does an empty `pool`.
    pub fn track_at(&mut self, delta: i32, pool: &[TrackId]) -> Option<TrackId> {
        let pos = self.cursor as i64 + delta as i64;
        if pos < 0 {
            return None;
        }
        let pos = pos as usize;
        let len = self.entries.len();

        if pos < len {
            return Some(self.entries[pos]);
        }
        if pos > len || pool.is_empty() {
            return None;
        }

        let id = match self.overlay.remove(&pos) {
            Some(queued) => queued,
            None => pool[self.rng.gen_range(0..pool.len())],
        };
        debug!("timeline: appended {} at {}", id, pos);
        self.entries.push(id);
        self.rev += 1;
        Some(id)
    }

    /// Move the cursor by `delta` if the target exists (or can be generated),
    /// then evict history.  Returns the new current track.
    pub fn advance(&mut self, delta: i32, pool: &[TrackId]) -> Option<TrackId> {
        let id = self.track_at(delta, pool)?;
        if delta != 0 {
            self.cursor = (self.cursor as i64 + delta as i64) as usize;
            self.rev += 1;
        }
        self.evict_if_over_threshold();
        Some(id)
    }

    /// Place `id` at the next explicit-queue slot after the current track.
    /// Returns the absolute position it was assigned.
    pub fn insert_at_queue_slot(&mut self, id: TrackId) -> usize {
        let pos = self.cursor + 1 + self.queue_slot;
        self.queue_slot += 1;

        match pos.cmp(&self.entries.len()) {
            std::cmp::Ordering::Less => self.entries[pos] = id,
            std::cmp::Ordering::Equal => self.entries.push(id),
            std::cmp::Ordering::Greater => {
                self.overlay.insert(pos, id);
            }
        }
        self.rev += 1;
        pos
    }

    pub fn reset_queue_slot(&mut self) {
        self.queue_slot = 0;
    }

    /// Drop the oldest entries while the cursor is past [`HISTORY_LIMIT`].
    /// Returns how many entries were dropped.
    pub fn evict_if_over_threshold(&mut self) -> usize {
        if self.cursor <= HISTORY_LIMIT {
            return 0;
        }
        let n = self.cursor - HISTORY_LIMIT;
        self.entries.drain(..n);
        self.cursor -= n;
        self.overlay = std::mem::take(&mut self.overlay)
            .into_iter()
            .filter_map(|(pos, id)| pos.checked_sub(n).map(|p| (p, id)))
            .collect();
        self.rev += 1;
        debug!("timeline: evicted {} entries, cursor now {}", n, self.cursor);
        n
    }
}

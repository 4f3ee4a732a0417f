//! Timeline checkpoint file.
//!
//! Layout, big-endian, whole file:
//!
//! ```text
//!   8 bytes   magic 0x00008a9d3f9fca31
//!   4 bytes   cursor index (i32)
//!   4 bytes   N = track count (i32)
//!   N*4 bytes track ids, timeline order (i32)
//!   4 bytes   pending seek offset, ms (i32)
//! ```
//!
//! Anything short, negative-sized or with the wrong magic decodes to `None`.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::timeline::TimelineSnapshot;
use crate::track::TrackId;

pub const SNAPSHOT_MAGIC: u64 = 0x0000_8a9d_3f9f_ca31;

const HEADER_LEN: usize = 8 + 4 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub cursor: i32,
    pub track_ids: Vec<TrackId>,
    pub pending_seek_ms: i32,
}

impl Snapshot {
    pub fn from_timeline(timeline: &TimelineSnapshot, pending_seek_ms: i32) -> Self {
        Self {
            cursor: timeline.cursor as i32,
            track_ids: timeline.entries.clone(),
            pending_seek_ms,
        }
    }

    /// Timeline part of the snapshot, if the cursor can be an index at all.
    pub fn timeline(&self) -> Option<TimelineSnapshot> {
        let cursor = usize::try_from(self.cursor).ok()?;
        Some(TimelineSnapshot {
            cursor,
            entries: self.track_ids.clone(),
        })
    }
}

pub fn encode(snapshot: &Snapshot) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + snapshot.track_ids.len() * 4 + 4);
    out.extend_from_slice(&SNAPSHOT_MAGIC.to_be_bytes());
    out.extend_from_slice(&snapshot.cursor.to_be_bytes());
    out.extend_from_slice(&(snapshot.track_ids.len() as i32).to_be_bytes());
    for id in &snapshot.track_ids {
        out.extend_from_slice(&id.0.to_be_bytes());
    }
    out.extend_from_slice(&snapshot.pending_seek_ms.to_be_bytes());
    out
}

pub fn decode(data: &[u8]) -> Option<Snapshot> {
    let mut reader = Reader { data };
    if reader.u64()? != SNAPSHOT_MAGIC {
        return None;
    }
    let cursor = reader.i32()?;
    let n = usize::try_from(reader.i32()?).ok()?;
    // Guard the allocation against a huge count in a short file.
    if reader.data.len() < n.checked_mul(4)?.checked_add(4)? {
        return None;
    }
    let track_ids = (0..n)
        .map(|_| reader.i32().map(TrackId))
        .collect::<Option<Vec<_>>>()?;
    let pending_seek_ms = reader.i32()?;
    Some(Snapshot {
        cursor,
        track_ids,
        pending_seek_ms,
    })
}

struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn take<const N: usize>(&mut self) -> Option<[u8; N]> {
        if self.data.len() < N {
            return None;
        }
        let (head, rest) = self.data.split_at(N);
        self.data = rest;
        head.try_into().ok()
    }

    fn u64(&mut self) -> Option<u64> {
        self.take::<8>().map(u64::from_be_bytes)
    }

    fn i32(&mut self) -> Option<i32> {
        self.take::<4>().map(i32::from_be_bytes)
    }
}

/// Where checkpoints go.
pub trait SnapshotStore: Send {
    /// Raw bytes of the last checkpoint, `Ok(None)` if there is none yet.
    fn read(&mut self) -> std::io::Result<Option<Vec<u8>>>;
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()>;
}

/// Checkpoints in a single file, replaced atomically on every write.
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotStore for FileStore {
    fn read(&mut self) -> std::io::Result<Option<Vec<u8>>> {
        match std::fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)
    }
}

/// Read and decode whatever the store holds.  Missing, unreadable and
/// malformed checkpoints all come back as `None`.
pub fn load(store: &mut dyn SnapshotStore) -> Option<Snapshot> {
    match store.read() {
        Ok(Some(bytes)) => {
            let snapshot = decode(&bytes);
            if snapshot.is_none() {
                warn!("persist: discarding malformed checkpoint ({} bytes)", bytes.len());
            }
            snapshot
        }
        Ok(None) => {
            debug!("persist: no checkpoint yet");
            None
        }
        Err(e) => {
            warn!("persist: failed to read checkpoint: {}", e);
            None
        }
    }
}

/// Encode and write; failures are logged and otherwise ignored.
pub fn save(store: &mut dyn SnapshotStore, snapshot: &Snapshot) -> bool {
    match store.write(&encode(snapshot)) {
        Ok(()) => {
            debug!(
                "persist: checkpoint written (cursor={}, {} tracks, seek={}ms)",
                snapshot.cursor,
                snapshot.track_ids.len(),
                snapshot.pending_seek_ms
            );
            true
        }
        Err(e) => {
            warn!("persist: failed to write checkpoint: {}", e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Snapshot {
        Snapshot {
            cursor: 2,
            track_ids: vec![TrackId(5), TrackId(6), TrackId(7)],
            pending_seek_ms: 1500,
        }
    }

    #[test]
    fn test_encode_layout() {
        let bytes = encode(&sample());
        assert_eq!(bytes.len(), 8 + 4 + 4 + 3 * 4 + 4);
        assert_eq!(&bytes[..8], &[0, 0, 0x8a, 0x9d, 0x3f, 0x9f, 0xca, 0x31]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 2]);
        assert_eq!(&bytes[12..16], &[0, 0, 0, 3]);
        assert_eq!(&bytes[16..20], &[0, 0, 0, 5]);
        assert_eq!(&bytes[28..32], &1500i32.to_be_bytes());
    }

    #[test]
    fn test_decode_round_trip() {
        let s = sample();
        assert_eq!(decode(&encode(&s)), Some(s));

        let empty = Snapshot {
            cursor: 0,
            track_ids: vec![],
            pending_seek_ms: 0,
        };
        assert_eq!(decode(&encode(&empty)), Some(empty));
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert_eq!(decode(&[]), None);
        assert_eq!(decode(b"not a snapshot at all"), None);

        let mut bad_magic = encode(&sample());
        bad_magic[7] ^= 0xff;
        assert_eq!(decode(&bad_magic), None);

        let full = encode(&sample());
        for cut in 0..full.len() {
            assert_eq!(decode(&full[..cut]), None, "truncated at {}", cut);
        }

        // Negative and absurd counts.
        let mut neg = full.clone();
        neg[12..16].copy_from_slice(&(-1i32).to_be_bytes());
        assert_eq!(decode(&neg), None);
        let mut huge = full;
        huge[12..16].copy_from_slice(&i32::MAX.to_be_bytes());
        assert_eq!(decode(&huge), None);
    }

    #[test]
    fn test_snapshot_timeline_conversion() {
        let s = sample();
        let t = s.timeline().unwrap();
        assert_eq!(t.cursor, 2);
        assert_eq!(Snapshot::from_timeline(&t, 1500), s);

        let neg = Snapshot {
            cursor: -1,
            ..sample()
        };
        assert!(neg.timeline().is_none());
    }

    #[test]
    fn test_file_store() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = FileStore::new(dir.path().join("sub").join("state"));
        assert!(load(&mut store).is_none());

        assert!(save(&mut store, &sample()));
        assert_eq!(load(&mut store), Some(sample()));

        std::fs::write(store.path(), b"junk").unwrap();
        assert!(load(&mut store).is_none());
    }
}

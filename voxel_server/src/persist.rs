//! World snapshot persistence.
//!
//! The snapshot is one JSON document:
//!
//! ```json
//! { "version": 2,
//!   "chunks": { "0,0": [1, 1, 2, ...] },
//!   "players": [{ "id": "ab12cd34", "name": "Bob", "pos": {"x":16,"y":13,"z":16}, "health": 20 }] }
//! ```
//!
//! Version 1 files carry chunks only. Writes go to `<file>.tmp` first and
//! are renamed over the canonical path.
//!
//! Saving is split in two: [`SnapshotStore::prepare`] serializes on the
//! caller's thread and [`PendingSave::write`] does the file IO, so the
//! write can run on a blocking thread. Each prepared save carries a sequence
//! number; a write older than the last one on disk is skipped.

use std::{
    collections::BTreeMap,
    ffi::OsString,
    fs,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use voxel_shared::math::Vec3;

/// Version written by this server.
pub const SNAPSHOT_VERSION: u32 = 2;

/// Persisted player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerRecord {
    pub id: String,
    pub name: String,
    pub pos: Vec3,
    pub health: i32,
}

/// Serializable view of the world.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorldSnapshot {
    pub version: u32,
    #[serde(default)]
    pub chunks: BTreeMap<String, Vec<u16>>,
    #[serde(default)]
    pub players: Vec<PlayerRecord>,
}

impl Default for WorldSnapshot {
    fn default() -> Self {
        Self {
            version: SNAPSHOT_VERSION,
            chunks: BTreeMap::new(),
            players: Vec::new(),
        }
    }
}

/// Reads and atomically writes the snapshot file.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
    issued: Arc<AtomicU64>,
    /// Sequence number of the newest snapshot on disk. Held while writing.
    written: Arc<Mutex<u64>>,
}

/// A serialized snapshot waiting to be written.
#[derive(Debug)]
pub struct PendingSave {
    store: SnapshotStore,
    seq: u64,
    data: Vec<u8>,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            issued: Arc::new(AtomicU64::new(0)),
            written: Arc::new(Mutex::new(0)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name: OsString = self.path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    /// Serializes `snapshot` for a later [`PendingSave::write`].
    pub fn prepare(&self, snapshot: &WorldSnapshot) -> anyhow::Result<PendingSave> {
        let data = serde_json::to_vec(snapshot).context("serialize snapshot")?;
        Ok(PendingSave {
            store: self.clone(),
            seq: self.issued.fetch_add(1, Ordering::Relaxed) + 1,
            data,
        })
    }

    /// Serializes and writes in one step.
    pub fn save(&self, snapshot: &WorldSnapshot) -> anyhow::Result<()> {
        self.prepare(snapshot)?.write().map(|_| ())
    }

    /// Returns `Ok(None)` when no snapshot exists yet.
    pub fn load(&self) -> anyhow::Result<Option<WorldSnapshot>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e).with_context(|| format!("read {}", self.path.display())),
        };
        let mut snapshot: WorldSnapshot = serde_json::from_slice(&data)
            .with_context(|| format!("parse {}", self.path.display()))?;
        if snapshot.version < 2 {
            snapshot.players.clear();
        }
        Ok(Some(snapshot))
    }
}

impl PendingSave {
    /// Writes the snapshot through the temp file. Returns `Ok(false)` when a
    /// newer snapshot was already written.
    pub fn write(self) -> anyhow::Result<bool> {
        let store = &self.store;
        let mut written = store
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *written >= self.seq {
            return Ok(false);
        }
        if let Some(dir) = store.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        let tmp = store.tmp_path();
        fs::write(&tmp, &self.data).with_context(|| format!("write {}", tmp.display()))?;
        fs::rename(&tmp, &store.path)
            .with_context(|| format!("rename {} -> {}", tmp.display(), store.path.display()))?;
        *written = self.seq;
        Ok(true)
    }
}

//! In-memory cache of pending upload assets, keyed by session.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Mutex;

/// Which of the two session assets an upload carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetKind {
    Photo,
    Drawing,
}

/// The pending uploads for one session.
#[derive(Debug, Clone, Default)]
pub struct PendingAssets {
    pub room: String,
    pub photo_path: Option<PathBuf>,
    pub drawing_path: Option<PathBuf>,
}

impl PendingAssets {
    /// Both assets present; the persona build can start.
    pub fn is_complete(&self) -> bool {
        self.photo_path.is_some() && self.drawing_path.is_some()
    }
}

/// Session-keyed cache of pending uploads.
///
/// All operations are synchronous under one mutex; nothing here awaits.
#[derive(Default)]
pub struct AssetCache {
    inner: Mutex<HashMap<String, PendingAssets>>,
}

impl AssetCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upsert one asset path, preserving whatever the other kind already has.
    pub fn remember(&self, session_id: &str, room: &str, kind: AssetKind, path: PathBuf) {
        let mut inner = self.inner.lock().expect("asset cache poisoned");
        let entry = inner.entry(session_id.to_string()).or_default();
        entry.room = room.to_string();
        match kind {
            AssetKind::Photo => entry.photo_path = Some(path),
            AssetKind::Drawing => entry.drawing_path = Some(path),
        }
    }

    /// Snapshot of a session's pending entry.
    pub fn get(&self, session_id: &str) -> Option<PendingAssets> {
        self.inner
            .lock()
            .expect("asset cache poisoned")
            .get(session_id)
            .cloned()
    }

    /// Drop a session's pending entry (duplicate-face rejection, build done).
    pub fn clear(&self, session_id: &str) {
        self.inner
            .lock()
            .expect("asset cache poisoned")
            .remove(session_id);
    }

    /// All pending session ids, for debug inspection.
    pub fn session_ids(&self) -> Vec<String> {
        self.inner
            .lock()
            .expect("asset cache poisoned")
            .keys()
            .cloned()
            .collect()
    }
}

//! Local filesystem snapshot store
//!
//! Layout under the root directory:
//! - `index.json`: every session and run
//! - `runs/<run id>/<snapshot id>.json`: one snapshot with its detections
//!
//! Every file is written to a temporary sibling and renamed into place, so a
//! snapshot and its detections appear together or not at all. Needs a
//! multi-threaded tokio runtime (writes go through `block_in_place`).

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

use super::{Run, Session, SnapshotStore};
use crate::snapshot::Snapshot;

const INDEX_FILE: &str = "index.json";
const RUNS_DIR: &str = "runs";

/// Configuration for local storage
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// Root directory for storage
    pub root_path: PathBuf,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("captures/db"),
        }
    }
}

/// Sessions and runs, persisted as `index.json`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    sessions: Vec<Session>,
    runs: Vec<Run>,
}

impl StoreIndex {
    fn next_session_id(&self) -> i64 {
        self.sessions.iter().map(|s| s.id).max().unwrap_or(0) + 1
    }

    fn next_run_id(&self) -> i64 {
        self.runs.iter().map(|r| r.id).max().unwrap_or(0) + 1
    }
}

/// A snapshot as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub id: i64,
    pub run_id: i64,
    pub snapshot: Snapshot,
}

/// Local filesystem snapshot store
pub struct LocalStore {
    config: LocalStoreConfig,
    index: Mutex<StoreIndex>,
    last_snapshot_id: AtomicI64,
}

impl LocalStore {
    /// Create a new local store, picking up whatever is already on disk
    pub fn new(config: LocalStoreConfig) -> Result<Self> {
        fs::create_dir_all(config.root_path.join(RUNS_DIR)).with_context(|| {
            format!("Failed to create store directory: {:?}", config.root_path)
        })?;

        let index = Self::load_index_sync(&config)?;
        let last_snapshot_id = Self::scan_snapshot_ids_sync(&config);

        info!(
            sessions = index.sessions.len(),
            runs = index.runs.len(),
            last_snapshot_id,
            "opened local store at {:?}",
            config.root_path
        );

        Ok(Self {
            config,
            index: Mutex::new(index),
            last_snapshot_id: AtomicI64::new(last_snapshot_id),
        })
    }

    fn load_index_sync(config: &LocalStoreConfig) -> Result<StoreIndex> {
        let path = config.root_path.join(INDEX_FILE);
        if !path.exists() {
            return Ok(StoreIndex::default());
        }
        let data =
            fs::read(&path).with_context(|| format!("Failed to read store index {:?}", path))?;
        serde_json::from_slice(&data).with_context(|| format!("Corrupt store index {:?}", path))
    }

    /// Highest snapshot id on disk, 0 when empty
    fn scan_snapshot_ids_sync(config: &LocalStoreConfig) -> i64 {
        let mut last = 0;
        if let Ok(runs) = fs::read_dir(config.root_path.join(RUNS_DIR)) {
            for run in runs.flatten().filter(|e| e.path().is_dir()) {
                if let Ok(files) = fs::read_dir(run.path()) {
                    for file in files.flatten() {
                        if let Some(id) = parse_snapshot_id(&file.path()) {
                            last = last.max(id);
                        }
                    }
                }
            }
        }
        last
    }

    fn run_dir(&self, run_id: i64) -> PathBuf {
        self.config.root_path.join(RUNS_DIR).join(run_id.to_string())
    }

    async fn persist_index(&self, index: &StoreIndex) -> Result<()> {
        let data = serde_json::to_vec_pretty(index).context("Failed to serialize store index")?;
        let path = self.config.root_path.join(INDEX_FILE);
        tokio::task::block_in_place(|| write_atomic(&path, &data))
    }

    pub async fn sessions(&self) -> Vec<Session> {
        self.index.lock().await.sessions.clone()
    }

    pub async fn runs(&self, session_id: i64) -> Vec<Run> {
        self.index
            .lock()
            .await
            .runs
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect()
    }

    /// Every snapshot stored for a run, ordered by id
    pub async fn snapshots(&self, run_id: i64) -> Result<Vec<StoredSnapshot>> {
        let dir = self.run_dir(run_id);
        tokio::task::block_in_place(|| {
            let mut stored = Vec::new();
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stored),
                Err(e) => return Err(e).with_context(|| format!("Failed to list {:?}", dir)),
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if parse_snapshot_id(&path).is_none() {
                    continue;
                }
                let data = fs::read(&path).with_context(|| format!("Failed to read {:?}", path))?;
                let snapshot: StoredSnapshot = serde_json::from_slice(&data)
                    .with_context(|| format!("Corrupt snapshot {:?}", path))?;
                stored.push(snapshot);
            }
            stored.sort_by_key(|s| s.id);
            Ok(stored)
        })
    }
}

#[async_trait::async_trait]
impl SnapshotStore for LocalStore {
    async fn open_session(&self, name: &str) -> Result<Session> {
        let mut index = self.index.lock().await;
        if let Some(existing) = index.sessions.iter().find(|s| s.name == name) {
            debug!(session = existing.id, name, "session already exists");
            return Ok(existing.clone());
        }
        let session = Session {
            id: index.next_session_id(),
            name: name.to_string(),
            start: Utc::now(),
            end: None,
        };
        index.sessions.push(session.clone());
        self.persist_index(&index).await?;
        info!(session = session.id, name, "session opened");
        Ok(session)
    }

    async fn close_session(&self, session_id: i64) -> Result<()> {
        let mut index = self.index.lock().await;
        let Some(session) = index.sessions.iter_mut().find(|s| s.id == session_id) else {
            bail!("Unknown session {}", session_id);
        };
        session.end = Some(Utc::now());
        self.persist_index(&index).await?;
        info!(session = session_id, "session closed");
        Ok(())
    }

    async fn open_run(&self, session_id: i64) -> Result<Run> {
        let mut index = self.index.lock().await;
        if !index.sessions.iter().any(|s| s.id == session_id) {
            bail!("Cannot open run: unknown session {}", session_id);
        }
        let run = Run {
            id: index.next_run_id(),
            guid: Uuid::new_v4(),
            session_id,
        };
        index.runs.push(run.clone());
        self.persist_index(&index).await?;
        info!(run = run.id, guid = %run.guid, session = session_id, "run opened");
        Ok(run)
    }

    async fn close_run(&self, run: &Run) -> Result<()> {
        debug!(run = run.id, "run closed");
        Ok(())
    }

    async fn save_snapshot(&self, run_id: i64, snapshot: &Snapshot) -> Result<i64> {
        let id = self.last_snapshot_id.fetch_add(1, Ordering::SeqCst) + 1;
        let stored = StoredSnapshot {
            id,
            run_id,
            snapshot: snapshot.clone(),
        };
        let data = serde_json::to_vec(&stored).context("Failed to serialize snapshot")?;
        let dir = self.run_dir(run_id);
        let path = dir.join(format!("{:010}.json", id));

        tokio::task::block_in_place(|| {
            fs::create_dir_all(&dir).with_context(|| format!("Failed to create {:?}", dir))?;
            write_atomic(&path, &data)
        })?;

        debug!(
            snapshot = id,
            run = run_id,
            detections = snapshot.detections.len(),
            "snapshot saved"
        );
        Ok(id)
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    fs::write(&tmp, data).with_context(|| format!("Failed to write {:?}", tmp))?;
    fs::rename(&tmp, path).with_context(|| format!("Failed to move {:?} into place", path))
}

fn parse_snapshot_id(path: &Path) -> Option<i64> {
    if path.extension()? != "json" {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::fixtures::make_snapshot;
    use tempfile::tempdir;

    fn test_config(dir: &Path) -> LocalStoreConfig {
        LocalStoreConfig {
            root_path: dir.to_path_buf(),
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn open_session_is_idempotent_by_name() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(test_config(dir.path())).unwrap();

        let first = store.open_session("morning").await.unwrap();
        let again = store.open_session("morning").await.unwrap();
        let other = store.open_session("evening").await.unwrap();

        assert_eq!(first, again);
        assert_ne!(first.id, other.id);
        assert_eq!(store.sessions().await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn close_session_records_end() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(test_config(dir.path())).unwrap();
        let session = store.open_session("s").await.unwrap();
        store.close_session(session.id).await.unwrap();

        let sessions = store.sessions().await;
        assert!(sessions[0].end.is_some());
        assert!(store.close_session(999).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn runs_require_a_known_session() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(test_config(dir.path())).unwrap();
        assert!(store.open_run(1).await.is_err());

        let session = store.open_session("s").await.unwrap();
        let a = store.open_run(session.id).await.unwrap();
        let b = store.open_run(session.id).await.unwrap();
        assert_ne!(a.id, b.id);
        assert_ne!(a.guid, b.guid);
        assert_eq!(store.runs(session.id).await.len(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn snapshot_and_detections_saved_together() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(test_config(dir.path())).unwrap();
        let session = store.open_session("s").await.unwrap();
        let run = store.open_run(session.id).await.unwrap();

        let id = store
            .save_snapshot(run.id, &make_snapshot("img-1", 3))
            .await
            .unwrap();
        store
            .save_snapshot(run.id, &make_snapshot("img-2", 0))
            .await
            .unwrap();

        let stored = store.snapshots(run.id).await.unwrap();
        assert_eq!(stored.len(), 2);
        assert_eq!(stored[0].id, id);
        assert_eq!(stored[0].snapshot.image_name, "img-1");
        assert_eq!(stored[0].snapshot.detections.len(), 3);
        assert_eq!(stored[1].snapshot.detections.len(), 0);

        // No temporary files left behind
        let leftovers = fs::read_dir(store.run_dir(run.id))
            .unwrap()
            .flatten()
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unknown_run_has_no_snapshots() {
        let dir = tempdir().unwrap();
        let store = LocalStore::new(test_config(dir.path())).unwrap();
        assert!(store.snapshots(42).await.unwrap().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn index_rebuilds_from_existing_files() {
        let dir = tempdir().unwrap();
        let (session_id, run_id) = {
            let store = LocalStore::new(test_config(dir.path())).unwrap();
            let session = store.open_session("persisted").await.unwrap();
            let run = store.open_run(session.id).await.unwrap();
            store
                .save_snapshot(run.id, &make_snapshot("a", 1))
                .await
                .unwrap();
            store
                .save_snapshot(run.id, &make_snapshot("b", 1))
                .await
                .unwrap();
            (session.id, run.id)
        };

        let reopened = LocalStore::new(test_config(dir.path())).unwrap();
        assert_eq!(reopened.open_session("persisted").await.unwrap().id, session_id);
        let next_run = reopened.open_run(session_id).await.unwrap();
        assert!(next_run.id > run_id);
        let next_id = reopened
            .save_snapshot(next_run.id, &make_snapshot("c", 0))
            .await
            .unwrap();
        assert_eq!(next_id, 3);
    }

    #[test]
    fn parses_snapshot_file_names() {
        assert_eq!(parse_snapshot_id(Path::new("runs/1/0000000042.json")), Some(42));
        assert_eq!(parse_snapshot_id(Path::new("runs/1/0000000042.json.tmp")), None);
        assert_eq!(parse_snapshot_id(Path::new("runs/1/index.json")), None);
    }
}

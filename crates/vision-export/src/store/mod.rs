//! Snapshot persistence
//!
//! Provides the [`SnapshotStore`] trait the session controller writes
//! through, plus two backends:
//! - [`LocalStore`]: JSON files on the local filesystem
//! - [`MemoryStore`]: in-process store with an event log

mod local;
mod memory;

pub use local::{LocalStore, LocalStoreConfig, StoredSnapshot};
pub use memory::{MemoryStore, StoreEvent};

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::snapshot::Snapshot;

/// A named capture session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: i64,
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
}

/// A run of continuous capture inside a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: i64,
    pub guid: Uuid,
    pub session_id: i64,
}

/// Persistence backend for sessions, runs and snapshots.
///
/// Calls for different resources may run concurrently; the session controller
/// serializes calls for the same resource.
#[async_trait::async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Open a session, or return the existing one with the same name.
    async fn open_session(&self, name: &str) -> Result<Session>;

    /// Record the end of a session.
    async fn close_session(&self, session_id: i64) -> Result<()>;

    /// Open a new run under `session_id`.
    async fn open_run(&self, session_id: i64) -> Result<Run>;

    /// Logically close a run. Backends may treat this as a no-op.
    async fn close_run(&self, run: &Run) -> Result<()>;

    /// Persist a snapshot and its detections atomically. Returns its id.
    async fn save_snapshot(&self, run_id: i64, snapshot: &Snapshot) -> Result<i64>;
}

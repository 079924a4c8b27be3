//! In-memory snapshot store
//!
//! Keeps everything in process and records every call as a [`StoreEvent`].
//! Used for dry runs and for checking the ordering of session and run
//! transitions. An optional per-call latency makes races observable.

use anyhow::{bail, Result};
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

use super::{Run, Session, SnapshotStore};
use crate::snapshot::Snapshot;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    SessionOpened(i64),
    SessionClosed(i64),
    RunOpened(i64),
    RunClosed(i64),
    SnapshotSaved { run_id: i64, snapshot_id: i64 },
}

#[derive(Default)]
struct MemoryState {
    sessions: Vec<Session>,
    runs: Vec<Run>,
    open_runs: HashSet<i64>,
    max_open_runs: usize,
    snapshots: Vec<(i64, Snapshot)>,
    events: Vec<StoreEvent>,
}

#[derive(Default)]
pub struct MemoryStore {
    latency: Duration,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every call by `latency` before it takes effect.
    pub fn with_latency(latency: Duration) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryState) -> T) -> T {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn events(&self) -> Vec<StoreEvent> {
        self.with_state(|s| s.events.clone())
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.with_state(|s| s.sessions.clone())
    }

    /// Saved snapshots with the run they belong to, in save order.
    pub fn snapshots(&self) -> Vec<(i64, Snapshot)> {
        self.with_state(|s| s.snapshots.clone())
    }

    /// Most runs that were ever open at the same time.
    pub fn max_open_runs(&self) -> usize {
        self.with_state(|s| s.max_open_runs)
    }

    pub fn open_runs(&self) -> usize {
        self.with_state(|s| s.open_runs.len())
    }
}

#[async_trait::async_trait]
impl SnapshotStore for MemoryStore {
    async fn open_session(&self, name: &str) -> Result<Session> {
        self.delay().await;
        Ok(self.with_state(|s| {
            if let Some(existing) = s.sessions.iter().find(|x| x.name == name) {
                return existing.clone();
            }
            let session = Session {
                id: s.sessions.len() as i64 + 1,
                name: name.to_string(),
                start: Utc::now(),
                end: None,
            };
            s.sessions.push(session.clone());
            s.events.push(StoreEvent::SessionOpened(session.id));
            session
        }))
    }

    async fn close_session(&self, session_id: i64) -> Result<()> {
        self.delay().await;
        self.with_state(|s| {
            let Some(session) = s.sessions.iter_mut().find(|x| x.id == session_id) else {
                bail!("Unknown session {}", session_id);
            };
            session.end = Some(Utc::now());
            s.events.push(StoreEvent::SessionClosed(session_id));
            Ok(())
        })
    }

    async fn open_run(&self, session_id: i64) -> Result<Run> {
        self.delay().await;
        self.with_state(|s| {
            if !s.sessions.iter().any(|x| x.id == session_id) {
                bail!("Cannot open run: unknown session {}", session_id);
            }
            let run = Run {
                id: s.runs.len() as i64 + 1,
                guid: Uuid::new_v4(),
                session_id,
            };
            s.runs.push(run.clone());
            s.open_runs.insert(run.id);
            s.max_open_runs = s.max_open_runs.max(s.open_runs.len());
            s.events.push(StoreEvent::RunOpened(run.id));
            Ok(run)
        })
    }

    async fn close_run(&self, run: &Run) -> Result<()> {
        self.delay().await;
        self.with_state(|s| {
            s.open_runs.remove(&run.id);
            s.events.push(StoreEvent::RunClosed(run.id));
        });
        Ok(())
    }

    async fn save_snapshot(&self, run_id: i64, snapshot: &Snapshot) -> Result<i64> {
        self.delay().await;
        Ok(self.with_state(|s| {
            s.snapshots.push((run_id, snapshot.clone()));
            let snapshot_id = s.snapshots.len() as i64;
            s.events.push(StoreEvent::SnapshotSaved {
                run_id,
                snapshot_id,
            });
            snapshot_id
        }))
    }
}

//! Session and run lifecycle
//!
//! Capture is grouped into sessions, and each session into runs. Store calls
//! run on the tokio runtime while the control thread keeps ticking. Each
//! resource has a single in-flight slot: a new session operation joins the
//! previous session operation first, and likewise for runs. The controller's
//! session and run handles change only when a finished operation is joined.
//!
//! Snapshot persistence is chained behind its artifact: the save starts only
//! after the encoder reports the files written. Those tasks are tracked so
//! `stop_run` can drain them.

use anyhow::{bail, Result};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinError;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::encoder::PendingArtifact;
use crate::inflight::InFlight;
use crate::snapshot::Snapshot;
use crate::store::{Run, Session, SnapshotStore};

/// Externally visible lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureState {
    NoSession,
    SessionOpen,
    RunOpen,
}

enum SessionTransition {
    Opened(Option<Session>),
    Closed(i64),
}

struct RunTransition {
    opened: Option<Run>,
    enable: bool,
}

pub struct SessionRunController {
    runtime: Handle,
    store: Arc<dyn SnapshotStore>,
    session: Option<Session>,
    run: Option<Run>,
    enabled: bool,
    session_op: InFlight<SessionTransition>,
    run_op: InFlight<RunTransition>,
    persist: TaskTracker,
}

impl SessionRunController {
    pub fn new(runtime: Handle, store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            runtime,
            store,
            session: None,
            run: None,
            enabled: false,
            session_op: InFlight::new("session"),
            run_op: InFlight::new("run"),
            persist: TaskTracker::new(),
        }
    }

    /// Open a session, closing the current one first. Without a name a
    /// random one is used.
    pub fn start_session(&mut self, name: Option<String>) {
        self.join_session();
        if self.session.is_some() {
            self.stop_session();
            self.join_session();
        }

        let name = name.unwrap_or_else(|| Uuid::new_v4().to_string());
        info!(name = %name, "starting session");
        let store = Arc::clone(&self.store);
        self.session_op.start(self.runtime.spawn(async move {
            match store.open_session(&name).await {
                Ok(session) => SessionTransition::Opened(Some(session)),
                Err(e) => {
                    warn!(name = %name, error = %e, "failed to open session");
                    SessionTransition::Opened(None)
                }
            }
        }));
    }

    /// Close the open session, stopping its run first. No-op without one.
    pub fn stop_session(&mut self) {
        self.join_session();
        let Some(session_id) = self.session.as_ref().map(|s| s.id) else {
            debug!("no session to stop");
            return;
        };
        if self.run.is_some() || self.run_op.is_pending() {
            self.stop_run();
            self.join_run();
        }

        info!(session = session_id, "stopping session");
        let store = Arc::clone(&self.store);
        self.session_op.start(self.runtime.spawn(async move {
            if let Err(e) = store.close_session(session_id).await {
                warn!(session = session_id, error = %e, "failed to close session");
            }
            SessionTransition::Closed(session_id)
        }));
    }

    /// Open a run under the current session, closing the open run first.
    /// Capture is enabled once the run is open if `auto_enable` is set.
    pub fn start_run(&mut self, auto_enable: bool) -> Result<()> {
        self.join_session();
        self.join_run();
        let Some(session_id) = self.session.as_ref().map(|s| s.id) else {
            bail!("cannot start a run without an open session");
        };

        let previous = self.run.clone();
        let store = Arc::clone(&self.store);
        info!(session = session_id, "starting run");
        self.run_op.start(self.runtime.spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = store.close_run(&previous).await {
                    warn!(run = previous.id, error = %e, "failed to close previous run");
                }
            }
            match store.open_run(session_id).await {
                Ok(run) => RunTransition {
                    opened: Some(run),
                    enable: auto_enable,
                },
                Err(e) => {
                    warn!(session = session_id, error = %e, "failed to open run");
                    RunTransition {
                        opened: None,
                        enable: false,
                    }
                }
            }
        }));
        Ok(())
    }

    /// Drain pending snapshot work, disable capture and drop the run.
    pub fn stop_run(&mut self) {
        self.join_run();
        self.drain();
        self.enabled = false;

        let Some(run) = self.run.take() else {
            return;
        };
        info!(run = run.id, "stopping run");
        let store = Arc::clone(&self.store);
        self.run_op.start(self.runtime.spawn(async move {
            if let Err(e) = store.close_run(&run).await {
                warn!(run = run.id, error = %e, "failed to close run");
            }
            RunTransition {
                opened: None,
                enable: false,
            }
        }));
    }

    /// Persist `snapshot` once `artifact` has been written.
    ///
    /// Returns `false` (and drops the snapshot) when no run is open.
    pub fn submit_snapshot(&mut self, snapshot: Snapshot, artifact: PendingArtifact) -> bool {
        let Some(run_id) = self.run.as_ref().map(|r| r.id) else {
            warn!(image = %snapshot.image_name, "no open run, snapshot dropped");
            return false;
        };
        let store = Arc::clone(&self.store);
        self.persist.spawn_on(
            async move {
                match artifact.written().await {
                    Ok(_) => match store.save_snapshot(run_id, &snapshot).await {
                        Ok(id) => debug!(snapshot = id, run = run_id, "snapshot persisted"),
                        Err(e) => {
                            warn!(image = %snapshot.image_name, error = %e, "failed to persist snapshot")
                        }
                    },
                    Err(e) => {
                        warn!(image = %snapshot.image_name, error = %e, "artifact missing, snapshot not persisted")
                    }
                }
            },
            &self.runtime,
        );
        true
    }

    /// Block until every submitted snapshot has been persisted or dropped.
    pub fn drain(&self) {
        if self.persist.is_empty() {
            return;
        }
        debug!(pending = self.persist.len(), "draining snapshot persistence");
        self.persist.close();
        self.runtime.block_on(self.persist.wait());
        self.persist.reopen();
    }

    /// Apply any session or run operation that has already finished.
    pub fn poll(&mut self) {
        if let Some(result) = self.session_op.try_join(&self.runtime) {
            self.apply_session(result);
        }
        if let Some(result) = self.run_op.try_join(&self.runtime) {
            self.apply_run(result);
        }
    }

    /// No session or run operation outstanding.
    pub fn is_ready(&mut self) -> bool {
        self.poll();
        !self.session_op.is_pending() && !self.run_op.is_pending()
    }

    /// Block until outstanding session and run operations finish.
    pub fn wait_for_transitions(&mut self) {
        self.join_session();
        self.join_run();
    }

    /// Stop everything and wait for it to land.
    pub fn shutdown(&mut self) {
        self.stop_session();
        self.wait_for_transitions();
        self.drain();
        info!("session controller shut down");
    }

    fn join_session(&mut self) {
        if let Some(result) = self.session_op.join(&self.runtime) {
            self.apply_session(result);
        }
    }

    fn join_run(&mut self) {
        if let Some(result) = self.run_op.join(&self.runtime) {
            self.apply_run(result);
        }
    }

    fn apply_session(&mut self, result: Result<SessionTransition, JoinError>) {
        match result {
            Ok(SessionTransition::Opened(session)) => {
                if let Some(s) = &session {
                    info!(session = s.id, name = %s.name, "session open");
                }
                self.session = session;
            }
            Ok(SessionTransition::Closed(id)) => {
                if self.session.as_ref().is_some_and(|s| s.id == id) {
                    self.session = None;
                }
            }
            Err(e) => {
                warn!(error = %e, "session task failed");
                self.session = None;
            }
        }
    }

    fn apply_run(&mut self, result: Result<RunTransition, JoinError>) {
        match result {
            Ok(RunTransition { opened, enable }) => {
                if let Some(run) = &opened {
                    info!(run = run.id, guid = %run.guid, enabled = enable, "run open");
                }
                self.enabled = opened.is_some() && enable;
                self.run = opened;
            }
            Err(e) => {
                warn!(error = %e, "run task failed");
                self.run = None;
                self.enabled = false;
            }
        }
    }

    pub fn state(&self) -> CaptureState {
        match (&self.session, &self.run) {
            (_, Some(_)) => CaptureState::RunOpen,
            (Some(_), None) => CaptureState::SessionOpen,
            (None, None) => CaptureState::NoSession,
        }
    }

    /// Capture is switched on for the current run.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn run(&self) -> Option<&Run> {
        self.run.as_ref()
    }

    /// Snapshots submitted but not yet persisted.
    pub fn pending_snapshots(&self) -> usize {
        self.persist.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::EncodeError;
    use crate::snapshot::fixtures::make_snapshot;
    use crate::store::{MemoryStore, StoreEvent};
    use std::time::Duration;
    use tokio::runtime::Runtime;

    fn runtime() -> Runtime {
        tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()
            .unwrap()
    }

    fn controller(rt: &Runtime, latency_ms: u64) -> (SessionRunController, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::with_latency(Duration::from_millis(latency_ms)));
        let ctl = SessionRunController::new(rt.handle().clone(), store.clone());
        (ctl, store)
    }

    // ========== Sessions ==========

    #[test]
    fn session_opens_after_join() {
        let rt = runtime();
        let (mut ctl, _store) = controller(&rt, 20);
        ctl.start_session(Some("alpha".into()));
        assert!(!ctl.is_ready());
        ctl.wait_for_transitions();
        assert!(ctl.is_ready());
        assert_eq!(ctl.state(), CaptureState::SessionOpen);
        assert_eq!(ctl.session().map(|s| s.name.as_str()), Some("alpha"));
    }

    #[test]
    fn second_session_waits_for_first_to_close() {
        let rt = runtime();
        let (mut ctl, store) = controller(&rt, 10);
        ctl.start_session(None);
        ctl.start_session(None);
        ctl.wait_for_transitions();

        assert_eq!(
            store.events(),
            vec![
                StoreEvent::SessionOpened(1),
                StoreEvent::SessionClosed(1),
                StoreEvent::SessionOpened(2),
            ]
        );
        assert_eq!(ctl.session().map(|s| s.id), Some(2));
    }

    #[test]
    fn stop_without_session_is_noop() {
        let rt = runtime();
        let (mut ctl, store) = controller(&rt, 0);
        ctl.stop_session();
        ctl.wait_for_transitions();
        assert!(store.events().is_empty());
        assert_eq!(ctl.state(), CaptureState::NoSession);
    }

    #[test]
    fn stop_session_closes_run_first() {
        let rt = runtime();
        let (mut ctl, store) = controller(&rt, 5);
        ctl.start_session(None);
        ctl.start_run(true).unwrap();
        ctl.stop_session();
        ctl.wait_for_transitions();

        assert_eq!(
            store.events(),
            vec![
                StoreEvent::SessionOpened(1),
                StoreEvent::RunOpened(1),
                StoreEvent::RunClosed(1),
                StoreEvent::SessionClosed(1),
            ]
        );
        assert_eq!(ctl.state(), CaptureState::NoSession);
        assert!(!ctl.is_enabled());
    }

    // ========== Runs ==========

    #[test]
    fn run_requires_session() {
        let rt = runtime();
        let (mut ctl, _store) = controller(&rt, 0);
        assert!(ctl.start_run(true).is_err());
    }

    #[test]
    fn back_to_back_runs_never_overlap() {
        let rt = runtime();
        let (mut ctl, store) = controller(&rt, 15);
        ctl.start_session(None);
        ctl.start_run(true).unwrap();
        ctl.start_run(true).unwrap();
        ctl.wait_for_transitions();

        assert_eq!(store.max_open_runs(), 1);
        assert_eq!(
            store.events(),
            vec![
                StoreEvent::SessionOpened(1),
                StoreEvent::RunOpened(1),
                StoreEvent::RunClosed(1),
                StoreEvent::RunOpened(2),
            ]
        );
        assert_eq!(ctl.run().map(|r| r.id), Some(2));
        assert_eq!(ctl.state(), CaptureState::RunOpen);
    }

    #[test]
    fn enable_follows_run_open() {
        let rt = runtime();
        let (mut ctl, _store) = controller(&rt, 10);
        ctl.start_session(None);
        ctl.start_run(true).unwrap();
        assert!(!ctl.is_enabled());
        ctl.wait_for_transitions();
        assert!(ctl.is_enabled());

        ctl.start_run(false).unwrap();
        ctl.wait_for_transitions();
        assert!(!ctl.is_enabled());
        assert_eq!(ctl.state(), CaptureState::RunOpen);
    }

    // ========== Persistence ==========

    #[test]
    fn stop_run_drains_pending_snapshots() {
        let rt = runtime();
        let (mut ctl, store) = controller(&rt, 30);
        ctl.start_session(None);
        ctl.start_run(true).unwrap();
        ctl.wait_for_transitions();

        for i in 0..3 {
            let accepted = ctl.submit_snapshot(
                make_snapshot(&format!("img-{i}"), 1),
                PendingArtifact::ready(Ok(Vec::new())),
            );
            assert!(accepted);
        }
        ctl.stop_run();

        assert_eq!(ctl.pending_snapshots(), 0);
        assert_eq!(store.snapshots().len(), 3);
        assert!(!ctl.is_enabled());
        assert_eq!(ctl.state(), CaptureState::SessionOpen);
    }

    #[test]
    fn failed_artifact_is_never_persisted() {
        let rt = runtime();
        let (mut ctl, store) = controller(&rt, 0);
        ctl.start_session(None);
        ctl.start_run(true).unwrap();
        ctl.wait_for_transitions();

        ctl.submit_snapshot(
            make_snapshot("broken", 0),
            PendingArtifact::ready(Err(EncodeError::NoColorPlanes)),
        );
        ctl.submit_snapshot(make_snapshot("fine", 0), PendingArtifact::ready(Ok(Vec::new())));
        ctl.drain();

        let saved = store.snapshots();
        assert_eq!(saved.len(), 1);
        assert_eq!(saved[0].1.image_name, "fine");
    }

    #[test]
    fn snapshot_without_run_is_dropped() {
        let rt = runtime();
        let (mut ctl, store) = controller(&rt, 0);
        ctl.start_session(None);
        ctl.wait_for_transitions();
        assert!(!ctl.submit_snapshot(make_snapshot("x", 0), PendingArtifact::ready(Ok(Vec::new()))));
        ctl.drain();
        assert!(store.snapshots().is_empty());
    }

    #[test]
    fn shutdown_closes_everything() {
        let rt = runtime();
        let (mut ctl, store) = controller(&rt, 5);
        ctl.start_session(Some("s".into()));
        ctl.start_run(true).unwrap();
        ctl.shutdown();
        assert_eq!(ctl.state(), CaptureState::NoSession);
        assert_eq!(store.open_runs(), 0);
        assert!(store.sessions()[0].end.is_some());
    }
}

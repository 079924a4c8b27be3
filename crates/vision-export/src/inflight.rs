//! Single-slot guard for background work
//!
//! Holds at most one outstanding task of a kind. Starting the next one means
//! joining the previous one first, which gives at-most-one-in-flight without a
//! queue. Joins block the calling thread, so they are only made from the
//! control thread, never from inside the runtime.

use tokio::runtime::Handle;
use tokio::task::{JoinError, JoinHandle};
use tracing::warn;

pub struct InFlight<T> {
    label: &'static str,
    handle: Option<JoinHandle<T>>,
}

impl<T> InFlight<T> {
    pub fn new(label: &'static str) -> Self {
        Self {
            label,
            handle: None,
        }
    }

    /// No task outstanding, or the outstanding one has finished.
    pub fn is_idle(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// A task was started and has not been joined yet.
    pub fn is_pending(&self) -> bool {
        self.handle.is_some()
    }

    /// Store a new task. Any task still in the slot must have been joined.
    pub fn start(&mut self, handle: JoinHandle<T>) {
        if self.handle.is_some() {
            warn!(slot = self.label, "replacing an unjoined task");
        }
        self.handle = Some(handle);
    }

    /// Block until the outstanding task (if any) finishes.
    pub fn join(&mut self, runtime: &Handle) -> Option<Result<T, JoinError>> {
        self.handle.take().map(|h| runtime.block_on(h))
    }

    /// Join only if the task has already finished.
    pub fn try_join(&mut self, runtime: &Handle) -> Option<Result<T, JoinError>> {
        if self.handle.as_ref().is_some_and(JoinHandle::is_finished) {
            self.join(runtime)
        } else {
            None
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }
}

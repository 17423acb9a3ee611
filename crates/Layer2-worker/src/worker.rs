//! Worker - an ephemeral isolated execution environment

use crate::state::WorkerState;
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use relay_foundation::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Isolation mechanism realising a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Host,
    Container,
    Pod,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Host => "host",
            BackendKind::Container => "container",
            BackendKind::Pod => "pod",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A worker owned by the backend that created it.
///
/// The dispatcher only holds it through the active-worker registry.
#[derive(Debug)]
pub struct Worker {
    /// Unique worker id (`relay-worker-<task>`)
    pub id: String,

    pub task_id: TaskId,

    pub kind: BackendKind,

    /// Platform handle: container id, pod name, or the worker id for host
    pub platform_ref: String,

    /// Working directory commands run in (inside the worker)
    pub workspace_path: PathBuf,

    /// Host-side workspace directory, if one backs the worker
    pub host_workspace: Option<PathBuf>,

    /// Auth material mounted into the worker (host path or secret name)
    pub auth_mount_ref: Option<String>,

    pub created_at: DateTime<Utc>,

    state: Mutex<WorkerState>,
}

impl Worker {
    /// Create a worker record in `Requested` state
    pub fn new(
        task_id: TaskId,
        kind: BackendKind,
        platform_ref: impl Into<String>,
        workspace_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: worker_id(&task_id),
            task_id,
            kind,
            platform_ref: platform_ref.into(),
            workspace_path: workspace_path.into(),
            host_workspace: None,
            auth_mount_ref: None,
            created_at: Utc::now(),
            state: Mutex::new(WorkerState::Requested),
        }
    }

    pub fn with_host_workspace(mut self, path: impl Into<PathBuf>) -> Self {
        self.host_workspace = Some(path.into());
        self
    }

    pub fn with_auth_mount(mut self, auth: Option<String>) -> Self {
        self.auth_mount_ref = auth;
        self
    }

    pub fn with_platform_ref(mut self, platform_ref: impl Into<String>) -> Self {
        self.platform_ref = platform_ref.into();
        self
    }

    pub fn workspace(&self) -> &Path {
        &self.workspace_path
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Move forward to `next`; regressions are rejected
    pub fn advance(&self, next: WorkerState) -> Result<()> {
        let mut state = self.state.lock();
        *state = state.advance(next)?;
        debug!(worker = %self.id, state = %next, "Worker state changed");
        Ok(())
    }

    /// Claim teardown. Returns true for exactly one caller while the
    /// worker is live on the platform.
    pub fn begin_teardown(&self) -> bool {
        let mut state = self.state.lock();
        if state.needs_teardown() {
            *state = WorkerState::Terminating;
            true
        } else {
            false
        }
    }

    /// Mark teardown finished
    pub fn mark_deleted(&self) {
        *self.state.lock() = WorkerState::Deleted;
    }

    /// Age of the worker
    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }
}

/// Worker id for a task
pub fn worker_id(task_id: &TaskId) -> String {
    format!("relay-worker-{}", task_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn worker() -> Worker {
        Worker::new(TaskId::new("42"), BackendKind::Host, "ref", "/tmp/ws")
    }

    #[test]
    fn test_new_worker() {
        let w = worker();
        assert_eq!(w.id, "relay-worker-42");
        assert_eq!(w.state(), WorkerState::Requested);
        assert_eq!(w.kind.to_string(), "host");
    }

    #[test]
    fn test_teardown_claimed_once() {
        let w = worker();
        // Not yet on the platform
        assert!(!w.begin_teardown());

        w.advance(WorkerState::Created).unwrap();
        w.advance(WorkerState::Ready).unwrap();
        assert!(w.begin_teardown());
        assert!(!w.begin_teardown());
        assert_eq!(w.state(), WorkerState::Terminating);

        w.mark_deleted();
        assert_eq!(w.state(), WorkerState::Deleted);
        assert!(w.advance(WorkerState::Executing).is_err());
    }
}

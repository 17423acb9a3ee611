//! Host backend - a workspace directory on the host

use super::WorkerBackend;
use crate::state::WorkerState;
use crate::task::Task;
use crate::transport::{ExecTransport, HostTransport};
use crate::worker::{worker_id, BackendKind, Worker};
use async_trait::async_trait;
use relay_foundation::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Always-available fallback. Workers are ready as soon as their workspace
/// directory exists, and the directory is kept after teardown.
#[derive(Clone)]
pub struct HostBackend {
    workspaces_root: Arc<PathBuf>,
    auth_dir: Option<PathBuf>,
    transport: HostTransport,
}

impl HostBackend {
    pub fn new(workspaces_root: impl Into<PathBuf>) -> Self {
        Self {
            workspaces_root: Arc::new(workspaces_root.into()),
            auth_dir: None,
            transport: HostTransport::new(),
        }
    }

    pub fn with_auth_dir(mut self, auth_dir: Option<PathBuf>) -> Self {
        self.auth_dir = auth_dir;
        self
    }

    pub fn with_transport(mut self, transport: HostTransport) -> Self {
        self.transport = transport;
        self
    }

    pub fn workspaces_root(&self) -> &Path {
        &self.workspaces_root
    }
}

#[async_trait]
impl WorkerBackend for HostBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Host
    }

    async fn create(&self, task: &Task) -> Result<Arc<Worker>> {
        task.id.validate()?;
        let workspace = self.workspaces_root.join(task.id.as_str());
        tokio::fs::create_dir_all(&workspace).await.map_err(|e| {
            Error::creation_failed(
                "host",
                format!("cannot create workspace {}: {}", workspace.display(), e),
            )
        })?;

        let worker = Worker::new(
            task.id.clone(),
            BackendKind::Host,
            worker_id(&task.id),
            &workspace,
        )
        .with_host_workspace(&workspace)
        .with_auth_mount(
            self.auth_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned()),
        );
        worker.advance(WorkerState::Created)?;
        Ok(Arc::new(worker))
    }

    async fn wait_ready(
        &self,
        _worker: &Worker,
        _timeout: Duration,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        Ok(())
    }

    fn transport(&self) -> ExecTransport {
        ExecTransport::Host(self.transport.clone())
    }

    async fn delete(&self, worker: &Worker) -> Result<()> {
        debug!(worker = %worker.id, workspace = %worker.workspace_path.display(), "Host workspace retained");
        Ok(())
    }

    async fn logs(&self, _worker: &Worker) -> Result<String> {
        Ok(String::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;

    #[tokio::test]
    async fn test_workspace_created_under_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = HostBackend::new(dir.path().join("workspaces"));
        let task = Task::new(TaskId::new("42"), "Hello", "acme/api");

        let worker = backend.create(&task).await.unwrap();
        assert_eq!(worker.workspace(), dir.path().join("workspaces/42"));
        assert!(worker.workspace().is_dir());
        assert_eq!(worker.id, "relay-worker-42");

        backend.delete(&worker).await.unwrap();
        assert!(worker.workspace().is_dir());
    }

    #[tokio::test]
    async fn test_task_id_cannot_escape_root() {
        let dir = tempfile::tempdir().unwrap();
        let backend = HostBackend::new(dir.path().join("a/workspaces"));
        let task = Task::new(TaskId::new("../../escaped"), "Hello", "acme/api");

        let err = backend.create(&task).await.unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert!(!dir.path().join("escaped").exists());
    }
}

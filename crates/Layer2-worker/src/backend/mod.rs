//! Worker backends
//!
//! A backend creates a worker for a task, waits until it can accept
//! commands, runs commands in it through its transport, and deletes it.
//!
//! - `HostBackend` - a workspace directory on the host, always available
//! - `ContainerBackend` - a container on the local container runtime
//! - `PodBackend` - a pod on the orchestration platform
//!
//! The dispatcher holds backends as the closed `Backend` enum and tries
//! them in preference order `Pod -> Container -> Host`.

mod container;
mod host;
mod pod;
pub mod pod_spec;
pub mod readiness;

pub use container::{parse_cpus, parse_memory, ContainerBackend, ContainerSettings};
pub use host::HostBackend;
pub use pod::{PodBackend, PodSettings};

use crate::task::Task;
use crate::transport::{ExecOptions, ExecTransport};
use crate::worker::{BackendKind, Worker};
use async_trait::async_trait;
use relay_foundation::{Error, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Keeps a worker container alive until it is deleted
pub const KEEP_ALIVE_COMMAND: [&str; 3] = ["tail", "-f", "/dev/null"];

/// Lines of platform logs attached to a readiness timeout
pub const READINESS_LOG_TAIL: usize = 100;

#[async_trait]
pub trait WorkerBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Create a worker for `task`. The returned worker is `Created`.
    ///
    /// Failures are `CreationFailed`, which lets the dispatcher fall back.
    async fn create(&self, task: &Task) -> Result<Arc<Worker>>;

    /// Wait until the worker accepts commands
    async fn wait_ready(
        &self,
        worker: &Worker,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Transport that reaches workers of this backend
    fn transport(&self) -> ExecTransport;

    async fn exec(&self, worker: &Worker, command: &str, options: &ExecOptions) -> Result<String> {
        self.transport().run(worker, command, options).await
    }

    /// Remove the worker from the platform
    async fn delete(&self, worker: &Worker) -> Result<()>;

    /// Recent platform logs, for diagnostics
    async fn logs(&self, worker: &Worker) -> Result<String>;
}

/// Closed set of backends
#[derive(Clone)]
pub enum Backend {
    Host(HostBackend),
    Container(ContainerBackend),
    Pod(PodBackend),
}

impl Backend {
    pub fn as_backend(&self) -> &dyn WorkerBackend {
        match self {
            Backend::Host(b) => b,
            Backend::Container(b) => b,
            Backend::Pod(b) => b,
        }
    }

    pub fn kind(&self) -> BackendKind {
        self.as_backend().kind()
    }

    /// Backends in preference order. Host is always last.
    pub fn ordered(
        pod: Option<PodBackend>,
        container: Option<ContainerBackend>,
        host: HostBackend,
    ) -> Vec<Backend> {
        let mut backends = Vec::with_capacity(3);
        if let Some(pod) = pod {
            backends.push(Backend::Pod(pod));
        }
        if let Some(container) = container {
            backends.push(Backend::Container(container));
        }
        backends.push(Backend::Host(host));
        backends
    }

    pub async fn create(&self, task: &Task) -> Result<Arc<Worker>> {
        let worker = self.as_backend().create(task).await?;
        info!(worker = %worker.id, backend = %self.kind(), "Worker created");
        Ok(worker)
    }

    /// Wait for readiness and mark the worker `Ready`.
    ///
    /// A timeout carries the worker's recent logs when they can be fetched.
    pub async fn wait_ready(
        &self,
        worker: &Worker,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        match self.as_backend().wait_ready(worker, timeout, cancel).await {
            Ok(()) => {
                worker.advance(crate::state::WorkerState::Ready)?;
                debug!(worker = %worker.id, "Worker ready");
                Ok(())
            }
            Err(Error::ReadinessTimeout {
                backend,
                worker: worker_id,
                timeout,
                ..
            }) => {
                let logs = match self.as_backend().logs(worker).await {
                    Ok(logs) if !logs.trim().is_empty() => Some(logs),
                    Ok(_) => None,
                    Err(e) => {
                        debug!(worker = %worker.id, "Could not fetch logs: {}", e);
                        None
                    }
                };
                warn!(worker = %worker_id, backend = %backend, "Worker not ready in time");
                Err(Error::ReadinessTimeout {
                    backend,
                    worker: worker_id,
                    timeout,
                    logs,
                })
            }
            Err(e) => Err(e),
        }
    }

    pub async fn exec(&self, worker: &Worker, command: &str, options: &ExecOptions) -> Result<String> {
        self.as_backend().exec(worker, command, options).await
    }

    pub async fn logs(&self, worker: &Worker) -> Result<String> {
        self.as_backend().logs(worker).await
    }

    pub fn transport(&self) -> ExecTransport {
        self.as_backend().transport()
    }

    /// Delete the worker once.
    ///
    /// Only the first caller for a live worker reaches the platform; later
    /// calls return `Ok(false)`. A platform failure still leaves the worker
    /// marked `Deleted` and is returned as `CleanupFailed`.
    pub async fn teardown(&self, worker: &Worker) -> Result<bool> {
        if !worker.begin_teardown() {
            return Ok(false);
        }

        let result = self.as_backend().delete(worker).await;
        worker.mark_deleted();

        match result {
            Ok(()) => {
                info!(worker = %worker.id, backend = %self.kind(), "Worker deleted");
                Ok(true)
            }
            Err(e) => Err(Error::cleanup_failed(&worker.id, e.to_string())),
        }
    }
}

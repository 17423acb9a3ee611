//! Task dispatcher - the worker lifecycle and execution engine
//!
//! For each task:
//! 1. resolve the continuation session
//! 2. lease a worker, creating one with backend fallback if none is active
//! 3. run the primary command with the task context on stdin
//! 4. run `EXEC:` directives from its output, in order
//! 5. touch the session and release the lease, tearing the worker down

use crate::backend::{
    Backend, ContainerBackend, ContainerSettings, HostBackend, PodBackend, PodSettings,
};
use crate::context::{PrimaryCommand, TaskContext};
use crate::directive::parse_directives;
use crate::platform::{DockerRuntime, KubePodApi};
use crate::registry::{ActiveWorker, WorkerRegistry};
use crate::reporter::{success_report, ResultReporter};
use crate::session::SessionRegistry;
use crate::state::WorkerState;
use crate::task::{ExecutionResult, Task};
use crate::transport::{ExecOptions, HostTransport};
use futures::FutureExt;
use relay_foundation::{Error, RelayConfig, Result};
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Environment variable carrying the session file path to the primary command
pub const SESSION_FILE_ENV: &str = "SESSION_FILE";

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatchSettings {
    pub readiness_timeout: Duration,
    /// None = the primary command may run indefinitely
    pub execution_timeout: Option<Duration>,
    pub primary: PrimaryCommand,
}

impl DispatchSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            readiness_timeout: config.readiness.timeout(),
            execution_timeout: config.primary.execution_timeout(),
            primary: PrimaryCommand::new(&config.primary.command),
        }
    }
}

pub struct TaskDispatcher {
    backends: Vec<Backend>,
    sessions: SessionRegistry,
    workers: WorkerRegistry,
    reporter: Arc<dyn ResultReporter>,
    settings: DispatchSettings,
}

impl TaskDispatcher {
    /// `backends` must already be in preference order
    pub fn new(
        backends: Vec<Backend>,
        sessions: SessionRegistry,
        workers: WorkerRegistry,
        reporter: Arc<dyn ResultReporter>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            backends,
            sessions,
            workers,
            reporter,
            settings,
        }
    }

    /// Build the backend chain from configuration.
    ///
    /// An enabled platform that cannot be reached is left out of the chain
    /// with a warning; the host backend is always present.
    pub async fn from_config(
        config: &RelayConfig,
        reporter: Arc<dyn ResultReporter>,
    ) -> Result<Self> {
        config.validate()?;

        #[allow(unused_mut)]
        let mut transport = HostTransport::new();
        #[cfg(unix)]
        if let Some(template) = &config.agent.socket_path {
            info!(socket = %template.display(), "Host commands routed through per-task agents");
            transport = transport.with_agent_socket(template);
        }
        let host = HostBackend::new(&config.paths.workspaces_dir)
            .with_auth_dir(config.paths.auth_dir.clone())
            .with_transport(transport);

        let container = if config.backends.container {
            match DockerRuntime::connect().await {
                Ok(runtime) => Some(ContainerBackend::new(
                    Arc::new(runtime),
                    ContainerSettings::from_config(config),
                )),
                Err(e) => {
                    warn!("Container backend unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let pod = if config.backends.orchestration {
            match KubePodApi::connect(&config.kubernetes.namespace).await {
                Ok(api) => Some(PodBackend::new(
                    Arc::new(api),
                    PodSettings::from_config(config),
                )),
                Err(e) => {
                    warn!("Pod backend unavailable: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let backends = Backend::ordered(pod, container, host);
        info!(
            backends = ?backends.iter().map(|b| b.kind().as_str()).collect::<Vec<_>>(),
            "Dispatcher ready"
        );

        Ok(Self::new(
            backends,
            SessionRegistry::new(&config.paths.sessions_dir),
            WorkerRegistry::new(),
            reporter,
            DispatchSettings::from_config(config),
        ))
    }

    pub fn backends(&self) -> &[Backend] {
        &self.backends
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn workers(&self) -> &WorkerRegistry {
        &self.workers
    }

    /// Workers currently serving tasks
    pub fn active_workers(&self) -> Vec<ActiveWorker> {
        self.workers.active_workers()
    }

    /// Best-effort teardown of every remaining worker
    pub async fn shutdown(&self) -> usize {
        self.workers.shutdown().await
    }

    /// Tear down workers older than `max_age`
    pub async fn cleanup_stale(&self, max_age: Duration) -> usize {
        self.workers.cleanup_stale(max_age).await
    }

    /// Process a task and report its outcome exactly once
    pub async fn dispatch(&self, task: &Task, cancel: &CancellationToken) -> Result<String> {
        let result = self.process(task, cancel).await;

        let message = match &result {
            Ok(output) => success_report(&task.id, output),
            Err(e) => {
                error!(task_id = %task.id, "Task failed: {}", e);
                e.user_message()
            }
        };

        if let Err(e) = self.reporter.post_result(&task.id, &message).await {
            error!(task_id = %task.id, "Failed to post result: {}", e);
        }

        result
    }

    /// Run a task to completion and return the primary command's output.
    ///
    /// The leased worker is released before this returns, whatever the
    /// outcome.
    pub async fn process(&self, task: &Task, cancel: &CancellationToken) -> Result<String> {
        let span = info_span!("task", task_id = %task.id);
        async move {
            task.id.validate()?;

            let session_path = self.sessions.get_or_create(&task.id).await?;

            let lease = self
                .workers
                .acquire(&task.id, || self.start_worker(task, cancel))
                .await?;

            let Some(active) = lease.active().cloned() else {
                lease.release().await;
                return Err(Error::Internal("leased slot has no worker".to_string()));
            };

            let outcome =
                AssertUnwindSafe(self.run_in_worker(task, &active, &session_path, cancel))
                    .catch_unwind()
                    .await;

            lease.release().await;

            match outcome {
                Ok(result) => result,
                Err(panic) => Err(Error::Internal(format!(
                    "execution panicked: {}",
                    panic_message(panic.as_ref())
                ))),
            }
        }
        .instrument(span)
        .await
    }

    /// Create a ready worker, trying backends in order
    async fn start_worker(&self, task: &Task, cancel: &CancellationToken) -> Result<ActiveWorker> {
        let mut attempts = Vec::new();

        for backend in &self.backends {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let kind = backend.kind();
            let worker = match backend.create(task).await {
                Ok(worker) => worker,
                Err(e) if e.triggers_fallback() => {
                    warn!(backend = %kind, "Worker creation failed, trying next backend: {}", e);
                    attempts.push(format!("{}: {}", kind, e));
                    continue;
                }
                Err(e) => return Err(e),
            };

            match backend
                .wait_ready(&worker, self.settings.readiness_timeout, cancel)
                .await
            {
                Ok(()) => {
                    return Ok(ActiveWorker {
                        worker,
                        backend: backend.clone(),
                    })
                }
                Err(e) => {
                    if let Err(cleanup) = backend.teardown(&worker).await {
                        warn!("{}", cleanup);
                    }
                    if !e.triggers_fallback() {
                        return Err(e);
                    }
                    if let Error::ReadinessTimeout {
                        logs: Some(logs), ..
                    } = &e
                    {
                        debug!(worker = %worker.id, "Logs before timeout:\n{}", logs);
                    }
                    warn!(backend = %kind, "Worker not ready, trying next backend: {}", e);
                    attempts.push(format!("{}: {}", kind, e));
                }
            }
        }

        Err(Error::BackendUnavailable { attempts })
    }

    async fn run_in_worker(
        &self,
        task: &Task,
        active: &ActiveWorker,
        session_path: &Path,
        cancel: &CancellationToken,
    ) -> Result<String> {
        let worker = &active.worker;
        worker.advance(WorkerState::Executing)?;

        let context = TaskContext::new(task, worker, session_path).render();
        let command = self.settings.primary.render(task, session_path)?;
        let options = ExecOptions::new()
            .with_stdin(context)
            .with_env(SESSION_FILE_ENV, session_path.to_string_lossy());

        info!(worker = %worker.id, backend = %active.backend.kind(), "Running primary command");
        let output = self
            .bounded(active.backend.exec(worker, &command, &options), cancel)
            .await?;

        let directives = parse_directives(&output);
        if !directives.is_empty() {
            info!(count = directives.len(), "Running directives");
        }
        for (index, directive) in directives.iter().enumerate() {
            if cancel.is_cancelled() {
                warn!(remaining = directives.len() - index, "Cancelled, skipping directives");
                break;
            }

            let result = ExecutionResult::from(
                active
                    .backend
                    .exec(worker, directive, &ExecOptions::new())
                    .await,
            );
            if result.success {
                debug!(directive = %directive, "Directive output:\n{}", result.output);
            } else {
                warn!(
                    directive = %directive,
                    error = result.error_detail.as_deref().unwrap_or_default(),
                    "Directive failed"
                );
            }
        }

        self.sessions.touch(&task.id);
        Ok(output)
    }

    /// Apply the execution timeout and cancellation to a command
    async fn bounded<F>(&self, exec: F, cancel: &CancellationToken) -> Result<String>
    where
        F: Future<Output = Result<String>>,
    {
        let limited = async {
            match self.settings.execution_timeout {
                Some(limit) => match tokio::time::timeout(limit, exec).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::execution_failed(
                        format!("execution exceeded {:?}", limit),
                        "",
                    )),
                },
                None => exec.await,
            }
        };

        tokio::select! {
            () = cancel.cancelled() => Err(Error::Cancelled),
            result = limited => result,
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

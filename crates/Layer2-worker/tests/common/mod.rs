//! Shared fakes for the dispatcher tests

#![allow(dead_code)]

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use parking_lot::Mutex;
use relay_foundation::{
    Error, KubernetesConfig, RepositoryMapping, ResourceLimits, Result, WorkerSecurity,
};
use relay_worker::backend::{ContainerSettings, PodSettings};
use relay_worker::platform::{
    Applied, ContainerRuntime, ContainerSpec, ContainerStatus, ExecOutput, PodApi,
    PodExecOutput, PodStatusView, Prerequisite,
};
use relay_worker::{
    Backend, ContainerBackend, DispatchSettings, ExecOptions, HostBackend, PodBackend,
    PrimaryCommand, ResultReporter, SessionRegistry, TaskDispatcher, TaskId, WorkerRegistry,
};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

// ============================================================================
// Container runtime
// ============================================================================

pub struct FakeRuntime {
    pub fail_create: bool,
    /// None = never ready
    pub ready_after: Option<Duration>,
    /// Exit code of every exec, None = never reported
    pub exit_code: Option<i64>,
    /// Exec output breaks off after `"partial output\n"`
    pub stream_failure: bool,
    pub exec_delay: Duration,
    pub remove_delay: Duration,
    pub created: AtomicUsize,
    pub removed: AtomicUsize,
    pub commands: Mutex<Vec<String>>,
    pub started_at: Mutex<Option<Instant>>,
}

impl FakeRuntime {
    pub fn ready() -> Self {
        Self {
            fail_create: false,
            ready_after: Some(Duration::ZERO),
            exit_code: Some(0),
            stream_failure: false,
            exec_delay: Duration::ZERO,
            remove_delay: Duration::ZERO,
            created: AtomicUsize::new(0),
            removed: AtomicUsize::new(0),
            commands: Mutex::new(Vec::new()),
            started_at: Mutex::new(None),
        }
    }

    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::ready()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn removed(&self) -> usize {
        self.removed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        if self.fail_create {
            return Err(Error::platform("image pull failed"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        *self.started_at.lock() = Some(Instant::now());
        Ok(format!("{}-id", spec.name))
    }

    async fn status(&self, _container: &str) -> Result<ContainerStatus> {
        let started = *self.started_at.lock();
        let running = match (started, self.ready_after) {
            (Some(at), Some(after)) => at.elapsed() >= after,
            _ => false,
        };
        Ok(ContainerStatus {
            running,
            health: None,
        })
    }

    async fn exec(
        &self,
        _container: &str,
        command: &str,
        _options: &ExecOptions,
    ) -> Result<ExecOutput> {
        self.commands.lock().push(command.to_string());
        if !self.exec_delay.is_zero() {
            tokio::time::sleep(self.exec_delay).await;
        }
        if self.stream_failure {
            return Ok(ExecOutput {
                stdout: "partial output\n".to_string(),
                stderr: String::new(),
                exit_code: None,
                failure: Some("exec stream failed: connection reset".to_string()),
            });
        }
        Ok(ExecOutput {
            stdout: "container ok\n".to_string(),
            stderr: String::new(),
            exit_code: self.exit_code,
            failure: None,
        })
    }

    async fn logs(&self, _container: &str, _tail: usize) -> Result<String> {
        Ok("fake container logs".to_string())
    }

    async fn remove(&self, _container: &str) -> Result<()> {
        if !self.remove_delay.is_zero() {
            tokio::time::sleep(self.remove_delay).await;
        }
        self.removed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Orchestration API
// ============================================================================

#[derive(Default)]
pub struct FakePodApi {
    pub fail_create: bool,
    pub applied: AtomicUsize,
    pub created: AtomicUsize,
    pub deleted: AtomicUsize,
}

impl FakePodApi {
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::default()
        }
    }
}

#[async_trait]
impl PodApi for FakePodApi {
    async fn apply(&self, _prerequisite: &Prerequisite) -> Result<Applied> {
        self.applied.fetch_add(1, Ordering::SeqCst);
        Ok(Applied::AlreadyExists)
    }

    async fn create_pod(&self, pod: &Pod) -> Result<String> {
        if self.fail_create {
            return Err(Error::platform("exceeded quota"));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(pod.metadata.name.clone().unwrap_or_default())
    }

    async fn pod_status(&self, _name: &str) -> Result<PodStatusView> {
        Ok(PodStatusView {
            phase: Some("Running".to_string()),
            ready_condition: Some(true),
        })
    }

    async fn exec(&self, _name: &str, _script: &str) -> Result<PodExecOutput> {
        Ok(PodExecOutput {
            stdout: "pod ok\n".to_string(),
            ..Default::default()
        })
    }

    async fn logs(&self, _name: &str, _tail: i64) -> Result<String> {
        Ok(String::new())
    }

    async fn delete_pod(&self, _name: &str) -> Result<()> {
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

// ============================================================================
// Reporter
// ============================================================================

#[derive(Default)]
pub struct RecordingReporter {
    pub posts: Mutex<Vec<(TaskId, String)>>,
}

impl RecordingReporter {
    pub fn posts(&self) -> Vec<(TaskId, String)> {
        self.posts.lock().clone()
    }
}

#[async_trait]
impl ResultReporter for RecordingReporter {
    async fn post_result(&self, task_id: &TaskId, text: &str) -> Result<()> {
        self.posts.lock().push((task_id.clone(), text.to_string()));
        Ok(())
    }
}

// ============================================================================
// Builders
// ============================================================================

pub fn container_backend(runtime: Arc<FakeRuntime>, workspaces: &Path) -> Backend {
    let settings = ContainerSettings {
        workspaces_root: workspaces.to_path_buf(),
        auth_dir: None,
        auth_mount_path: "/app/auth".to_string(),
        repositories: RepositoryMapping::default(),
        resources: ResourceLimits::default(),
        security: WorkerSecurity::default(),
        poll_interval: Duration::from_millis(500),
    };
    Backend::Container(ContainerBackend::new(runtime, settings))
}

pub fn pod_backend(api: Arc<FakePodApi>) -> Backend {
    let settings = PodSettings {
        kubernetes: KubernetesConfig::default(),
        auth_dir: None,
        auth_mount_path: "/app/auth".to_string(),
        repositories: RepositoryMapping::default(),
        resources: ResourceLimits::default(),
        security: WorkerSecurity::default(),
        poll_interval: Duration::from_millis(500),
    };
    Backend::Pod(PodBackend::new(api, settings))
}

pub fn host_backend(workspaces: &Path) -> Backend {
    Backend::Host(HostBackend::new(workspaces))
}

pub fn dispatcher(
    backends: Vec<Backend>,
    sessions: &Path,
    primary: &str,
    reporter: Arc<RecordingReporter>,
) -> TaskDispatcher {
    TaskDispatcher::new(
        backends,
        SessionRegistry::new(sessions),
        WorkerRegistry::new(),
        reporter,
        DispatchSettings {
            readiness_timeout: Duration::from_secs(5),
            execution_timeout: None,
            primary: PrimaryCommand::new(primary),
        },
    )
}

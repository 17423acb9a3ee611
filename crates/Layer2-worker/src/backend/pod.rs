//! Pod backend - a pod on the orchestration platform

use super::pod_spec::{self, is_valid_secret_key};
use super::readiness::poll_until_ready;
use super::{WorkerBackend, READINESS_LOG_TAIL};
use crate::platform::{Applied, PodApi};
use crate::state::WorkerState;
use crate::task::Task;
use crate::transport::{ExecTransport, PodTransport};
use crate::worker::{BackendKind, Worker};
use async_trait::async_trait;
use k8s_openapi::ByteString;
use relay_foundation::{
    Error, KubernetesConfig, RelayConfig, RepositoryMapping, ResourceLimits, Result,
    WorkerSecurity,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pod backend settings
#[derive(Debug, Clone)]
pub struct PodSettings {
    pub kubernetes: KubernetesConfig,
    pub auth_dir: Option<PathBuf>,
    pub auth_mount_path: String,
    pub repositories: RepositoryMapping,
    pub resources: ResourceLimits,
    pub security: WorkerSecurity,
    pub poll_interval: Duration,
}

impl PodSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            kubernetes: config.kubernetes.clone(),
            auth_dir: config.paths.auth_dir.clone(),
            auth_mount_path: config.paths.auth_mount_path.clone(),
            repositories: config.repositories.clone(),
            resources: config.resources.clone(),
            security: config.security.clone(),
            poll_interval: config.readiness.poll_interval(),
        }
    }

    /// Auth files are mounted from a secret
    pub fn has_auth(&self) -> bool {
        self.auth_dir.is_some()
    }
}

#[derive(Clone)]
pub struct PodBackend {
    api: Arc<dyn PodApi>,
    settings: Arc<PodSettings>,
    prerequisites: Arc<OnceCell<()>>,
}

impl PodBackend {
    pub fn new(api: Arc<dyn PodApi>, settings: PodSettings) -> Self {
        Self {
            api,
            settings: Arc::new(settings),
            prerequisites: Arc::new(OnceCell::new()),
        }
    }

    pub fn settings(&self) -> &PodSettings {
        &self.settings
    }

    /// Apply namespace prerequisites once per backend. A failed attempt is
    /// retried by the next task.
    async fn ensure_prerequisites(&self) -> Result<()> {
        self.prerequisites
            .get_or_try_init(|| async move {
                let auth_files = match &self.settings.auth_dir {
                    Some(dir) => Some(read_auth_files(dir).await?),
                    None => None,
                };

                for object in pod_spec::prerequisites(&self.settings, auth_files) {
                    match self.api.apply(&object).await? {
                        Applied::Created => {
                            info!(kind = object.kind(), name = object.name(), "Created")
                        }
                        Applied::AlreadyExists => {
                            debug!(kind = object.kind(), name = object.name(), "Already exists")
                        }
                    }
                }
                Ok::<_, Error>(())
            })
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl WorkerBackend for PodBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Pod
    }

    async fn create(&self, task: &Task) -> Result<Arc<Worker>> {
        self.ensure_prerequisites().await.map_err(creation_failed)?;

        let name = pod_spec::pod_name(task);
        let pod = pod_spec::worker_pod(task, &name, &self.settings).map_err(creation_failed)?;
        let created = self.api.create_pod(&pod).await.map_err(creation_failed)?;

        let repo = self.settings.repositories.resolve(&task.target_repository);
        let auth = if self.settings.has_auth() {
            Some(self.settings.kubernetes.auth_secret.clone())
        } else {
            None
        };

        let worker = Worker::new(task.id.clone(), BackendKind::Pod, created, &repo.workspace)
            .with_auth_mount(auth);
        worker.advance(WorkerState::Created)?;
        Ok(Arc::new(worker))
    }

    async fn wait_ready(
        &self,
        worker: &Worker,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let api = &self.api;
        poll_until_ready(
            "pod",
            &worker.id,
            timeout,
            self.settings.poll_interval,
            cancel,
            move || async move {
                api.pod_status(&worker.platform_ref)
                    .await
                    .map(|status| status.is_ready())
            },
        )
        .await
    }

    fn transport(&self) -> ExecTransport {
        ExecTransport::Pod(PodTransport::new(Arc::clone(&self.api)))
    }

    async fn delete(&self, worker: &Worker) -> Result<()> {
        self.api.delete_pod(&worker.platform_ref).await
    }

    async fn logs(&self, worker: &Worker) -> Result<String> {
        self.api
            .logs(&worker.platform_ref, READINESS_LOG_TAIL as i64)
            .await
    }
}

fn creation_failed(e: impl std::fmt::Display) -> Error {
    Error::creation_failed("pod", e.to_string())
}

/// Regular files of `dir`, keyed by file name
async fn read_auth_files(dir: &Path) -> Result<BTreeMap<String, ByteString>> {
    let mut files = BTreeMap::new();
    let mut entries = tokio::fs::read_dir(dir).await?;

    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if !is_valid_secret_key(&name) {
            warn!(file = %name, "Skipping auth file with unusable name");
            continue;
        }
        let content = tokio::fs::read(entry.path()).await?;
        files.insert(name, ByteString(content));
    }

    Ok(files)
}

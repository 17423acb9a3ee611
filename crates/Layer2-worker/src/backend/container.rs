//! Container backend - a container on the local container runtime

use super::readiness::poll_until_ready;
use super::{WorkerBackend, KEEP_ALIVE_COMMAND, READINESS_LOG_TAIL};
use crate::platform::{ContainerRuntime, ContainerSpec};
use crate::state::WorkerState;
use crate::task::Task;
use crate::transport::{ContainerTransport, ExecTransport};
use crate::worker::{worker_id, BackendKind, Worker};
use async_trait::async_trait;
use relay_foundation::{
    Error, RelayConfig, RepositoryMapping, ResourceLimits, Result, WorkerSecurity,
};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Container backend settings
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub workspaces_root: PathBuf,
    pub auth_dir: Option<PathBuf>,
    pub auth_mount_path: String,
    pub repositories: RepositoryMapping,
    pub resources: ResourceLimits,
    pub security: WorkerSecurity,
    pub poll_interval: Duration,
}

impl ContainerSettings {
    pub fn from_config(config: &RelayConfig) -> Self {
        Self {
            workspaces_root: config.paths.workspaces_dir.clone(),
            auth_dir: config.paths.auth_dir.clone(),
            auth_mount_path: config.paths.auth_mount_path.clone(),
            repositories: config.repositories.clone(),
            resources: config.resources.clone(),
            security: config.security.clone(),
            poll_interval: config.readiness.poll_interval(),
        }
    }

    /// Container spec for `task`, with `host_workspace` bound to the
    /// repository workspace
    pub fn spec_for(&self, task: &Task, host_workspace: &Path) -> Result<ContainerSpec> {
        let repo = self.repositories.resolve(&task.target_repository);

        let mut env = vec![
            format!("REPOSITORY={}", task.target_repository),
            format!("WORKSPACE={}", repo.workspace),
            format!("ISSUE_ID={}", task.id),
        ];
        env.extend(repo.env.iter().cloned());

        let mut binds = vec![format!("{}:{}", host_workspace.display(), repo.workspace)];
        if let Some(auth_dir) = &self.auth_dir {
            binds.push(format!(
                "{}:{}:ro",
                auth_dir.display(),
                self.auth_mount_path
            ));
        }

        let labels = HashMap::from([
            ("app".to_string(), "relay".to_string()),
            ("component".to_string(), "worker".to_string()),
            ("issue".to_string(), task.id.to_string()),
            ("repository".to_string(), task.target_repository.clone()),
        ]);

        Ok(ContainerSpec {
            name: worker_id(&task.id),
            image: repo.image.clone(),
            working_dir: repo.workspace.clone(),
            env,
            binds,
            ports: repo.ports.clone(),
            labels,
            command: KEEP_ALIVE_COMMAND.iter().map(|s| s.to_string()).collect(),
            memory_bytes: self.resources.memory.as_deref().map(parse_memory).transpose()?,
            nano_cpus: self.resources.cpu.as_deref().map(parse_cpus).transpose()?,
            read_only_root: self.security.read_only_root,
            no_new_privileges: self.security.no_new_privileges,
            user: self.security.user.clone(),
            cap_add: self.security.capabilities.add.clone(),
            cap_drop: self.security.capabilities.drop.clone(),
        })
    }
}

#[derive(Clone)]
pub struct ContainerBackend {
    runtime: Arc<dyn ContainerRuntime>,
    settings: Arc<ContainerSettings>,
}

impl ContainerBackend {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, settings: ContainerSettings) -> Self {
        Self {
            runtime,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }
}

#[async_trait]
impl WorkerBackend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    async fn create(&self, task: &Task) -> Result<Arc<Worker>> {
        task.id.validate()?;
        let host_workspace = self.settings.workspaces_root.join(task.id.as_str());
        tokio::fs::create_dir_all(&host_workspace)
            .await
            .map_err(creation_failed)?;
        // Bind mounts need an absolute source
        let host_workspace = tokio::fs::canonicalize(&host_workspace)
            .await
            .map_err(creation_failed)?;

        let spec = self
            .settings
            .spec_for(task, &host_workspace)
            .map_err(creation_failed)?;
        let container_id = self
            .runtime
            .create_and_start(&spec)
            .await
            .map_err(creation_failed)?;

        let worker = Worker::new(
            task.id.clone(),
            BackendKind::Container,
            container_id,
            spec.working_dir.clone(),
        )
        .with_host_workspace(host_workspace)
        .with_auth_mount(
            self.settings
                .auth_dir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned()),
        );
        worker.advance(WorkerState::Created)?;
        Ok(Arc::new(worker))
    }

    async fn wait_ready(
        &self,
        worker: &Worker,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let runtime = &self.runtime;
        poll_until_ready(
            "container",
            &worker.id,
            timeout,
            self.settings.poll_interval,
            cancel,
            move || async move {
                runtime
                    .status(&worker.platform_ref)
                    .await
                    .map(|status| status.is_ready())
            },
        )
        .await
    }

    fn transport(&self) -> ExecTransport {
        ExecTransport::Container(ContainerTransport::new(Arc::clone(&self.runtime)))
    }

    async fn delete(&self, worker: &Worker) -> Result<()> {
        self.runtime.remove(&worker.platform_ref).await
    }

    async fn logs(&self, worker: &Worker) -> Result<String> {
        self.runtime
            .logs(&worker.platform_ref, READINESS_LOG_TAIL)
            .await
    }
}

fn creation_failed(e: impl std::fmt::Display) -> Error {
    Error::creation_failed("container", e.to_string())
}

/// Parse a memory size (`"512m"`, `"2g"`, `"1Gi"`, `"1048576"`) into bytes
pub fn parse_memory(value: &str) -> Result<i64> {
    let lower = value.trim().to_ascii_lowercase();
    let lower = lower.strip_suffix('b').unwrap_or(&lower);
    let lower = lower.strip_suffix('i').unwrap_or(lower);

    let (number, multiplier) = match lower.chars().last() {
        Some('k') => (&lower[..lower.len() - 1], 1i64 << 10),
        Some('m') => (&lower[..lower.len() - 1], 1 << 20),
        Some('g') => (&lower[..lower.len() - 1], 1 << 30),
        Some('t') => (&lower[..lower.len() - 1], 1 << 40),
        _ => (lower, 1),
    };

    let parsed: f64 = number
        .trim()
        .parse()
        .map_err(|_| Error::InvalidInput(format!("invalid memory size: {}", value)))?;
    if parsed <= 0.0 {
        return Err(Error::InvalidInput(format!("invalid memory size: {}", value)));
    }
    Ok((parsed * multiplier as f64) as i64)
}

/// Parse a CPU amount (`"1.5"`, `"500m"`) into nano CPUs
pub fn parse_cpus(value: &str) -> Result<i64> {
    let trimmed = value.trim();
    let cpus = match trimmed.strip_suffix('m') {
        Some(milli) => milli.parse::<f64>().map(|m| m / 1000.0),
        None => trimmed.parse::<f64>(),
    }
    .map_err(|_| Error::InvalidInput(format!("invalid cpu amount: {}", value)))?;

    if cpus <= 0.0 {
        return Err(Error::InvalidInput(format!("invalid cpu amount: {}", value)));
    }
    Ok((cpus * 1_000_000_000.0) as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;
    use relay_foundation::RepositoryConfig;

    fn settings() -> ContainerSettings {
        let mut config = RelayConfig::default();
        config.paths.auth_dir = Some(PathBuf::from("/srv/auth"));
        config.resources.memory = Some("2g".into());
        config.resources.cpu = Some("500m".into());
        config.repositories.repositories.insert(
            "acme/web".into(),
            RepositoryConfig {
                image: "node:20".into(),
                workspace: "/app".into(),
                env: vec!["NODE_ENV=test".into()],
                ports: vec!["3000:3000".into()],
            },
        );
        ContainerSettings::from_config(&config)
    }

    #[test]
    fn test_parse_memory() {
        assert_eq!(parse_memory("512m").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_memory("2g").unwrap(), 2 * 1024 * 1024 * 1024);
        assert_eq!(parse_memory("1Gi").unwrap(), 1024 * 1024 * 1024);
        assert_eq!(parse_memory("64MB").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_memory("1048576").unwrap(), 1_048_576);
        assert!(parse_memory("lots").is_err());
        assert!(parse_memory("0").is_err());
    }

    #[test]
    fn test_parse_cpus() {
        assert_eq!(parse_cpus("1").unwrap(), 1_000_000_000);
        assert_eq!(parse_cpus("1.5").unwrap(), 1_500_000_000);
        assert_eq!(parse_cpus("500m").unwrap(), 500_000_000);
        assert!(parse_cpus("-1").is_err());
    }

    #[test]
    fn test_spec_uses_repository_mapping() {
        let task = Task::new(TaskId::new("42"), "Hello", "acme/web");
        let spec = settings()
            .spec_for(&task, Path::new("/srv/workspaces/42"))
            .unwrap();

        assert_eq!(spec.name, "relay-worker-42");
        assert_eq!(spec.image, "node:20");
        assert_eq!(spec.working_dir, "/app");
        assert_eq!(
            spec.binds,
            vec![
                "/srv/workspaces/42:/app".to_string(),
                "/srv/auth:/app/auth:ro".to_string()
            ]
        );
        assert!(spec.env.contains(&"ISSUE_ID=42".to_string()));
        assert!(spec.env.contains(&"NODE_ENV=test".to_string()));
        assert_eq!(spec.labels.get("issue").map(String::as_str), Some("42"));
        assert_eq!(spec.memory_bytes, Some(2 << 30));
        assert_eq!(spec.nano_cpus, Some(500_000_000));
        assert!(spec.no_new_privileges);
    }

    #[test]
    fn test_unmapped_repository_uses_default() {
        let task = Task::new(TaskId::new("7"), "Hello", "acme/other");
        let spec = settings().spec_for(&task, Path::new("/ws/7")).unwrap();
        assert_eq!(spec.image, relay_foundation::DEFAULT_WORKER_IMAGE);
        assert_eq!(spec.working_dir, "/workspace");
    }
}

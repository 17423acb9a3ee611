//! Docker runtime - bollard client behind `ContainerRuntime`

use super::{ContainerRuntime, ContainerSpec, ContainerStatus, ExecOutput, HealthState};
use crate::transport::ExecOptions;
use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HealthStatusEnum, HostConfig, PortBinding};
use bollard::Docker;
use futures::StreamExt;
use relay_foundation::{Error, Result};
use std::collections::HashMap;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// Grace period before a stopped container is killed (seconds)
const STOP_GRACE_SECS: i64 = 10;

/// Container runtime backed by the local Docker daemon
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
}

impl DockerRuntime {
    /// Connect with local defaults and check the daemon answers
    pub async fn connect() -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| Error::Platform(format!("Failed to connect to Docker: {}", e)))?;
        docker
            .ping()
            .await
            .map_err(|e| Error::Platform(format!("Docker is not responding: {}", e)))?;
        info!("Connected to Docker");
        Ok(Self { docker })
    }

    /// Wrap an existing client
    pub fn from_client(docker: Docker) -> Self {
        Self { docker }
    }

    fn container_config(spec: &ContainerSpec) -> Config<String> {
        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        for mapping in &spec.ports {
            let (host, container) = mapping.split_once(':').unwrap_or((mapping, mapping));
            let key = if container.contains('/') {
                container.to_string()
            } else {
                format!("{}/tcp", container)
            };
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: None,
                    host_port: Some(host.to_string()),
                }]),
            );
        }

        let mut security_opt = Vec::new();
        if spec.no_new_privileges {
            security_opt.push("no-new-privileges:true".to_string());
        }

        let host_config = HostConfig {
            binds: non_empty(spec.binds.clone()),
            port_bindings: if port_bindings.is_empty() {
                None
            } else {
                Some(port_bindings)
            },
            memory: spec.memory_bytes,
            nano_cpus: spec.nano_cpus,
            readonly_rootfs: Some(spec.read_only_root),
            security_opt: non_empty(security_opt),
            cap_add: non_empty(spec.cap_add.clone()),
            cap_drop: non_empty(spec.cap_drop.clone()),
            auto_remove: Some(false),
            ..Default::default()
        };

        Config {
            image: Some(spec.image.clone()),
            working_dir: Some(spec.working_dir.clone()),
            env: Some(spec.env.clone()),
            labels: Some(spec.labels.clone()),
            cmd: non_empty(spec.command.clone()),
            user: spec.user.clone(),
            exposed_ports: if exposed_ports.is_empty() {
                None
            } else {
                Some(exposed_ports)
            },
            host_config: Some(host_config),
            ..Default::default()
        }
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(Some(options), Self::container_config(spec))
            .await
            .map_err(|e| Error::platform(format!("Failed to create container: {}", e)))?;

        for warning in &response.warnings {
            warn!(container = %spec.name, "Docker warning: {}", warning);
        }

        if let Err(e) = self
            .docker
            .start_container(&response.id, None::<StartContainerOptions<String>>)
            .await
        {
            // Do not leave a created-but-stopped container behind
            let _ = self.remove(&response.id).await;
            return Err(Error::platform(format!("Failed to start container: {}", e)));
        }

        debug!(container = %spec.name, id = %response.id, "Container started");
        Ok(response.id)
    }

    async fn status(&self, container: &str) -> Result<ContainerStatus> {
        let info = self
            .docker
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
            .map_err(|e| Error::platform(format!("Failed to inspect container: {}", e)))?;

        let state = info.state.unwrap_or_default();
        let health = state
            .health
            .and_then(|h| h.status)
            .and_then(|status| match status {
                HealthStatusEnum::STARTING => Some(HealthState::Starting),
                HealthStatusEnum::HEALTHY => Some(HealthState::Healthy),
                HealthStatusEnum::UNHEALTHY => Some(HealthState::Unhealthy),
                _ => None,
            });

        Ok(ContainerStatus {
            running: state.running.unwrap_or(false),
            health,
        })
    }

    async fn exec(
        &self,
        container: &str,
        command: &str,
        options: &ExecOptions,
    ) -> Result<ExecOutput> {
        let exec_options = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
            attach_stdin: Some(options.stdin.is_some()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            working_dir: options
                .workdir
                .as_ref()
                .map(|dir| dir.to_string_lossy().into_owned()),
            env: non_empty(
                options
                    .env
                    .iter()
                    .map(|(k, v)| format!("{}={}", k, v))
                    .collect(),
            ),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(container, exec_options)
            .await
            .map_err(|e| Error::platform(format!("Failed to create exec: {}", e)))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::platform(format!("Failed to start exec: {}", e)))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, mut input } = started {
            let stdin = options.stdin.clone();
            let feed = async move {
                if let Some(stdin) = stdin {
                    input.write_all(stdin.as_bytes()).await?;
                    input.shutdown().await?;
                }
                Ok::<_, std::io::Error>(())
            };

            let collect = async {
                while let Some(msg) = output.next().await {
                    match msg {
                        Ok(LogOutput::StdOut { message }) => {
                            stdout.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(LogOutput::StdErr { message }) => {
                            stderr.push_str(&String::from_utf8_lossy(&message));
                        }
                        Ok(_) => {}
                        Err(e) => return Err(e),
                    }
                }
                Ok(())
            };

            let (fed, collected) = tokio::join!(feed, collect);
            if let Err(e) = fed {
                debug!("exec stdin closed early: {}", e);
            }
            if let Err(e) = collected {
                return Ok(ExecOutput {
                    stdout,
                    stderr,
                    exit_code: None,
                    failure: Some(format!("exec stream failed: {}", e)),
                });
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .map_err(|e| Error::platform(format!("Failed to inspect exec: {}", e)))?;

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: inspect.exit_code,
            failure: None,
        })
    }

    async fn logs(&self, container: &str, tail: usize) -> Result<String> {
        let options = LogsOptions::<String> {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            ..Default::default()
        };

        let mut stream = self.docker.logs(container, Some(options));
        let mut content = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk =
                chunk.map_err(|e| Error::platform(format!("Failed to read logs: {}", e)))?;
            content.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(content)
    }

    async fn remove(&self, container: &str) -> Result<()> {
        if let Err(e) = self
            .docker
            .stop_container(container, Some(StopContainerOptions { t: STOP_GRACE_SECS }))
            .await
        {
            if !is_not_found(&e) {
                debug!(container, "Stop failed (may already be stopped): {}", e);
            }
        }

        match self
            .docker
            .remove_container(
                container,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if is_not_found(&e) => Ok(()),
            Err(e) => Err(Error::platform(format!("Failed to remove container: {}", e))),
        }
    }
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn non_empty<T>(items: Vec<T>) -> Option<Vec<T>> {
    if items.is_empty() {
        None
    } else {
        Some(items)
    }
}

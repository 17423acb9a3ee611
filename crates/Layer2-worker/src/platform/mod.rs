//! Platform adapters
//!
//! Narrow traits over the container runtime and the orchestration API. The
//! backends and transports only talk to these, so they can be driven by
//! in-memory fakes in tests:
//! - `ContainerRuntime` - implemented by `DockerRuntime` (bollard)
//! - `PodApi` - implemented by `KubePodApi` (kube)

pub mod docker;
pub mod kubernetes;

pub use docker::DockerRuntime;
pub use kubernetes::KubePodApi;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use relay_foundation::Result;
use std::collections::HashMap;

use crate::transport::ExecOptions;

// ============================================================================
// Container runtime
// ============================================================================

/// Everything needed to create a worker container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub working_dir: String,
    /// `NAME=value`
    pub env: Vec<String>,
    /// `host:container[:ro]`
    pub binds: Vec<String>,
    /// `host:container` port pairs
    pub ports: Vec<String>,
    pub labels: HashMap<String, String>,
    pub command: Vec<String>,
    pub memory_bytes: Option<i64>,
    pub nano_cpus: Option<i64>,
    pub read_only_root: bool,
    pub no_new_privileges: bool,
    pub user: Option<String>,
    pub cap_add: Vec<String>,
    pub cap_drop: Vec<String>,
}

/// Health reported by a container healthcheck
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Starting,
    Healthy,
    Unhealthy,
}

/// Observed container status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerStatus {
    pub running: bool,
    /// None when the image defines no healthcheck
    pub health: Option<HealthState>,
}

impl ContainerStatus {
    /// Running, and healthy if a healthcheck exists
    pub fn is_ready(&self) -> bool {
        self.running && self.health.map_or(true, |h| h == HealthState::Healthy)
    }
}

/// Raw output of an exec
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// None if the exec has not reported completion
    pub exit_code: Option<i64>,
    /// Output stream broke off; `stdout`/`stderr` hold what arrived first
    pub failure: Option<String>,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Create and start a container, returning its id
    async fn create_and_start(&self, spec: &ContainerSpec) -> Result<String>;

    async fn status(&self, container: &str) -> Result<ContainerStatus>;

    /// Run `sh -c <command>` in a running container
    async fn exec(&self, container: &str, command: &str, options: &ExecOptions)
        -> Result<ExecOutput>;

    /// Last `tail` lines of container output
    async fn logs(&self, container: &str, tail: usize) -> Result<String>;

    /// Stop and force-remove. A container that is already gone is not an error.
    async fn remove(&self, container: &str) -> Result<()>;
}

// ============================================================================
// Orchestration API
// ============================================================================

/// Namespace-level objects a pod worker depends on
#[derive(Debug, Clone)]
pub enum Prerequisite {
    ServiceAccount(ServiceAccount),
    Role(Role),
    RoleBinding(RoleBinding),
    Secret(Secret),
}

impl Prerequisite {
    pub fn kind(&self) -> &'static str {
        match self {
            Prerequisite::ServiceAccount(_) => "ServiceAccount",
            Prerequisite::Role(_) => "Role",
            Prerequisite::RoleBinding(_) => "RoleBinding",
            Prerequisite::Secret(_) => "Secret",
        }
    }

    pub fn name(&self) -> &str {
        let meta = match self {
            Prerequisite::ServiceAccount(o) => &o.metadata,
            Prerequisite::Role(o) => &o.metadata,
            Prerequisite::RoleBinding(o) => &o.metadata,
            Prerequisite::Secret(o) => &o.metadata,
        };
        meta.name.as_deref().unwrap_or_default()
    }
}

/// Outcome of creating a prerequisite
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Created,
    AlreadyExists,
}

/// Observed pod status
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodStatusView {
    pub phase: Option<String>,
    /// Value of the `Ready` condition, None if not reported
    pub ready_condition: Option<bool>,
}

impl PodStatusView {
    /// Phase `Running` and no `Ready` condition reporting false
    pub fn is_ready(&self) -> bool {
        self.phase.as_deref() == Some("Running") && self.ready_condition != Some(false)
    }
}

/// Raw output of a pod exec, streams kept apart
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodExecOutput {
    pub stdout: String,
    pub stderr: String,
    /// Failure reported by the exec status channel, or a broken stream
    pub failure: Option<String>,
}

#[async_trait]
pub trait PodApi: Send + Sync {
    /// Create a namespace object; an existing one reports `AlreadyExists`
    async fn apply(&self, prerequisite: &Prerequisite) -> Result<Applied>;

    /// Create a pod, returning its name
    async fn create_pod(&self, pod: &Pod) -> Result<String>;

    async fn pod_status(&self, name: &str) -> Result<PodStatusView>;

    /// Run `sh -c <script>` in the worker container
    async fn exec(&self, name: &str, script: &str) -> Result<PodExecOutput>;

    async fn logs(&self, name: &str, tail: i64) -> Result<String>;

    /// Delete a pod. A pod that is already gone is not an error.
    async fn delete_pod(&self, name: &str) -> Result<()>;
}

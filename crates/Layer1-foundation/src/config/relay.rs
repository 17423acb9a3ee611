//! Relay Config - 엔진 통합 설정
//!
//! JSON 또는 TOML 파일에서 로드하고, 환경 변수로 일부 값을 덮어쓴 뒤
//! `validate()`로 시작 전에 검증한다.

use super::repository::{RepositoryMapping, ResourceLimits, WorkerSecurity};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// 설정 파일명
pub const RELAY_CONFIG_FILE: &str = "config.json";

/// 기본 primary 명령 템플릿
pub const DEFAULT_PRIMARY_COMMAND: &str =
    "claude --print --max-turns {max_turns} --output-format {output_format}";

// 환경 변수 키
pub const ENV_ORCHESTRATION: &str = "RELAY_ORCHESTRATION";
pub const ENV_CONTAINER: &str = "RELAY_CONTAINER";
pub const ENV_NAMESPACE: &str = "RELAY_NAMESPACE";
pub const ENV_WORKSPACES_DIR: &str = "RELAY_WORKSPACES_DIR";
pub const ENV_SESSIONS_DIR: &str = "RELAY_SESSIONS_DIR";

// ============================================================================
// Relay Config (통합)
// ============================================================================

/// Relay 통합 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RelayConfig {
    #[serde(default)]
    pub backends: BackendToggles,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub primary: PrimaryCommandConfig,

    #[serde(default)]
    pub readiness: ReadinessConfig,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub kubernetes: KubernetesConfig,

    #[serde(default)]
    pub repositories: RepositoryMapping,

    #[serde(default)]
    pub resources: ResourceLimits,

    #[serde(default)]
    pub security: WorkerSecurity,

    #[serde(default)]
    pub agent: AgentConfig,
}

/// 백엔드 활성화 여부 (Host는 항상 활성)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendToggles {
    /// Kubernetes pod 워커 사용
    #[serde(default)]
    pub orchestration: bool,

    /// Docker 컨테이너 워커 사용
    #[serde(default)]
    pub container: bool,
}

/// 호스트 경로 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathsConfig {
    #[serde(default = "default_workspaces_dir")]
    pub workspaces_dir: PathBuf,

    #[serde(default = "default_sessions_dir")]
    pub sessions_dir: PathBuf,

    /// 워커에 읽기 전용으로 마운트할 인증 파일 디렉토리
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_dir: Option<PathBuf>,

    /// 워커 내부 인증 마운트 경로
    #[serde(default = "default_auth_mount")]
    pub auth_mount_path: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            workspaces_dir: default_workspaces_dir(),
            sessions_dir: default_sessions_dir(),
            auth_dir: None,
            auth_mount_path: default_auth_mount(),
        }
    }
}

/// Primary 명령 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimaryCommandConfig {
    /// `{max_turns}`, `{output_format}`, `{session_file}` 치환 지원
    #[serde(default = "default_primary_command")]
    pub command: String,

    /// 강제 실행 제한 시간 (None = 제한 없음)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution_timeout_secs: Option<u64>,
}

impl Default for PrimaryCommandConfig {
    fn default() -> Self {
        Self {
            command: default_primary_command(),
            execution_timeout_secs: None,
        }
    }
}

impl PrimaryCommandConfig {
    pub fn execution_timeout(&self) -> Option<Duration> {
        self.execution_timeout_secs.map(Duration::from_secs)
    }
}

/// 준비 상태 폴링 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessConfig {
    #[serde(default = "default_readiness_timeout")]
    pub timeout_secs: u64,

    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,
}

impl Default for ReadinessConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_readiness_timeout(),
            poll_interval_ms: default_poll_interval(),
        }
    }
}

impl ReadinessConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Dispatch pool 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// 동시에 처리할 최대 task 수
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
        }
    }
}

/// Kubernetes 설정
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KubernetesConfig {
    #[serde(default = "default_namespace")]
    pub namespace: String,

    #[serde(default = "default_service_account")]
    pub service_account: String,

    #[serde(default = "default_role")]
    pub role: String,

    #[serde(default = "default_role_binding")]
    pub role_binding: String,

    /// 인증 파일을 담을 secret 이름
    #[serde(default = "default_auth_secret")]
    pub auth_secret: String,
}

impl Default for KubernetesConfig {
    fn default() -> Self {
        Self {
            namespace: default_namespace(),
            service_account: default_service_account(),
            role: default_role(),
            role_binding: default_role_binding(),
            auth_secret: default_auth_secret(),
        }
    }
}

/// agent 소켓 경로 템플릿의 task id 자리표시자
pub const AGENT_SOCKET_PLACEHOLDER: &str = "{task_id}";

/// 호스트 워커의 in-worker agent 설정
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentConfig {
    /// 설정 시 Host 워커 명령을 task별 agent로 보낸다.
    /// agent 하나는 owner 하나만 받으므로 `{task_id}`가 반드시 포함되어야 한다
    /// (예: `/tmp/relay-agent-{task_id}.sock`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_path: Option<PathBuf>,
}

impl RelayConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // ========================================================================
    // Load
    // ========================================================================

    /// 파일에서 로드 (확장자 `.toml`이면 TOML, 그 외 JSON)
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        let is_toml = path
            .extension()
            .map(|ext| ext.eq_ignore_ascii_case("toml"))
            .unwrap_or(false);

        let config = if is_toml {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?
        };

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// 글로벌 설정 파일 경로 (~/.config/relay/config.json)
    pub fn global_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Cannot find config directory".to_string()))?;
        Ok(dir.join("relay").join(RELAY_CONFIG_FILE))
    }

    /// 글로벌 설정 로드 (파일이 없으면 기본값)
    pub fn load_global() -> Result<Self> {
        let path = Self::global_path()?;
        if !path.exists() {
            return Ok(Self::default());
        }
        Self::load(path)
    }

    // ========================================================================
    // Environment
    // ========================================================================

    /// 프로세스 환경 변수 적용
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_env_from(std::env::vars())
    }

    /// 주어진 (key, value) 목록으로 덮어쓰기
    pub fn apply_env_from<I>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                ENV_ORCHESTRATION => self.backends.orchestration = parse_flag(&key, &value)?,
                ENV_CONTAINER => self.backends.container = parse_flag(&key, &value)?,
                ENV_NAMESPACE => self.kubernetes.namespace = value,
                ENV_WORKSPACES_DIR => self.paths.workspaces_dir = PathBuf::from(value),
                ENV_SESSIONS_DIR => self.paths.sessions_dir = PathBuf::from(value),
                _ => {}
            }
        }
        Ok(())
    }

    // ========================================================================
    // Validation
    // ========================================================================

    /// 필수 설정 검증 (시작 시 치명적)
    pub fn validate(&self) -> Result<()> {
        if self.primary.command.trim().is_empty() {
            return Err(Error::Config("primary.command must not be empty".into()));
        }
        if self.pool.max_concurrent == 0 {
            return Err(Error::Config("pool.maxConcurrent must be at least 1".into()));
        }
        if self.readiness.poll_interval_ms == 0 {
            return Err(Error::Config(
                "readiness.pollIntervalMs must be greater than 0".into(),
            ));
        }
        if self.backends.orchestration {
            let k8s = &self.kubernetes;
            for (name, value) in [
                ("kubernetes.namespace", &k8s.namespace),
                ("kubernetes.serviceAccount", &k8s.service_account),
                ("kubernetes.role", &k8s.role),
                ("kubernetes.roleBinding", &k8s.role_binding),
            ] {
                if value.trim().is_empty() {
                    return Err(Error::Config(format!(
                        "{} is required when orchestration is enabled",
                        name
                    )));
                }
            }
        }
        if self.backends.orchestration || self.backends.container {
            let default = &self.repositories.default;
            if default.image.trim().is_empty() {
                return Err(Error::Config(
                    "repositories.default.image is required for isolated backends".into(),
                ));
            }
            if let Some((repo, _)) = self
                .repositories
                .repositories
                .iter()
                .find(|(_, cfg)| cfg.image.trim().is_empty())
            {
                return Err(Error::Config(format!(
                    "repositories.{}.image must not be empty",
                    repo
                )));
            }
        }
        if let Some(template) = &self.agent.socket_path {
            if !template.to_string_lossy().contains(AGENT_SOCKET_PLACEHOLDER) {
                return Err(Error::Config(format!(
                    "agent.socketPath must contain {} (one agent serves one task)",
                    AGENT_SOCKET_PLACEHOLDER
                )));
            }
        }
        Ok(())
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(Error::Config(format!(
            "{} must be a boolean, got '{}'",
            key, other
        ))),
    }
}

fn default_workspaces_dir() -> PathBuf {
    PathBuf::from("workspaces")
}

fn default_sessions_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_auth_mount() -> String {
    "/app/auth".to_string()
}

fn default_primary_command() -> String {
    DEFAULT_PRIMARY_COMMAND.to_string()
}

fn default_readiness_timeout() -> u64 {
    120
}

fn default_poll_interval() -> u64 {
    2000
}

fn default_max_concurrent() -> usize {
    4
}

fn default_namespace() -> String {
    "relay".to_string()
}

fn default_service_account() -> String {
    "relay-worker".to_string()
}

fn default_role() -> String {
    "relay-worker-role".to_string()
}

fn default_role_binding() -> String {
    "relay-worker-binding".to_string()
}

fn default_auth_secret() -> String {
    "relay-auth".to_string()
}

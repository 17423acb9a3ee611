//! Config - 통합 설정 관리
//!
//! - `relay.rs` - RelayConfig 통합 설정 (로드, 환경 변수, 검증)
//! - `repository.rs` - 저장소별 워커 설정, 리소스 제한, 보안

mod relay;
mod repository;

pub use relay::{
    AgentConfig, BackendToggles, KubernetesConfig, PathsConfig, PoolConfig,
    PrimaryCommandConfig, ReadinessConfig, RelayConfig, AGENT_SOCKET_PLACEHOLDER,
    DEFAULT_PRIMARY_COMMAND, ENV_CONTAINER, ENV_NAMESPACE, ENV_ORCHESTRATION, ENV_SESSIONS_DIR,
    ENV_WORKSPACES_DIR, RELAY_CONFIG_FILE,
};
pub use repository::{
    CapabilityConfig, RepositoryConfig, RepositoryMapping, ResourceLimits, WorkerSecurity,
    DEFAULT_WORKER_IMAGE, DEFAULT_WORKER_WORKSPACE,
};

//! # relay-foundation
//!
//! Foundation layer for Relay:
//! - Error: 엔진 전체 에러 분류 (fallback 여부, 사용자 메시지)
//! - Config: 통합 설정 (RelayConfig, 저장소 매핑, 리소스/보안)

pub mod config;
pub mod error;

// ============================================================================
// Error
// ============================================================================
pub use error::{Error, Result};

// ============================================================================
// Config (설정)
// ============================================================================
pub use config::{
    AgentConfig, BackendToggles, CapabilityConfig, KubernetesConfig, PathsConfig, PoolConfig,
    PrimaryCommandConfig, ReadinessConfig, RelayConfig, RepositoryConfig, RepositoryMapping,
    ResourceLimits, WorkerSecurity, DEFAULT_PRIMARY_COMMAND, DEFAULT_WORKER_IMAGE,
    DEFAULT_WORKER_WORKSPACE, AGENT_SOCKET_PLACEHOLDER, RELAY_CONFIG_FILE,
};

//! Repository mapping - 저장소별 워커 설정
//!
//! 저장소 이름(`owner/repo`)마다 이미지, 작업 디렉토리, 환경 변수를
//! 지정하고, 매핑에 없는 저장소는 `default` 항목을 사용한다.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// 기본 워커 이미지
pub const DEFAULT_WORKER_IMAGE: &str = "ubuntu:22.04";

/// 워커 내부 기본 작업 디렉토리
pub const DEFAULT_WORKER_WORKSPACE: &str = "/workspace";

/// 저장소 하나에 대한 워커 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryConfig {
    /// 컨테이너/파드 이미지
    #[serde(default = "default_image")]
    pub image: String,

    /// 워커 내부 작업 디렉토리
    #[serde(default = "default_workspace")]
    pub workspace: String,

    /// 추가 환경 변수 (`NAME=value`)
    #[serde(default)]
    pub env: Vec<String>,

    /// 노출할 포트 (`host:container`)
    #[serde(default)]
    pub ports: Vec<String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            workspace: default_workspace(),
            env: Vec::new(),
            ports: Vec::new(),
        }
    }
}

impl RepositoryConfig {
    /// `NAME=value` 목록을 (name, value) 쌍으로 분해
    ///
    /// `=`가 없는 항목은 빈 값으로 취급한다.
    pub fn env_pairs(&self) -> Vec<(String, String)> {
        self.env
            .iter()
            .map(|entry| match entry.split_once('=') {
                Some((name, value)) => (name.to_string(), value.to_string()),
                None => (entry.clone(), String::new()),
            })
            .collect()
    }
}

/// 저장소 → 워커 설정 매핑
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryMapping {
    #[serde(default)]
    pub repositories: HashMap<String, RepositoryConfig>,

    #[serde(default)]
    pub default: RepositoryConfig,
}

impl RepositoryMapping {
    /// 저장소 설정 조회 (없으면 default)
    pub fn resolve(&self, repository: &str) -> &RepositoryConfig {
        self.repositories.get(repository).unwrap_or(&self.default)
    }
}

/// 컨테이너/파드 리소스 제한
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceLimits {
    /// 메모리 (예: "2g", "512Mi")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<String>,

    /// CPU (예: "1", "1.5", "500m")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu: Option<String>,
}

/// Linux capability 추가/제거
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilityConfig {
    #[serde(default)]
    pub add: Vec<String>,

    #[serde(default)]
    pub drop: Vec<String>,
}

/// 워커 보안 설정
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSecurity {
    #[serde(default)]
    pub read_only_root: bool,

    #[serde(default = "default_true")]
    pub no_new_privileges: bool,

    /// 실행 사용자 (`uid` 또는 `uid:gid`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default)]
    pub capabilities: CapabilityConfig,
}

impl Default for WorkerSecurity {
    fn default() -> Self {
        Self {
            read_only_root: false,
            no_new_privileges: true,
            user: None,
            capabilities: CapabilityConfig::default(),
        }
    }
}

impl WorkerSecurity {
    /// `user`의 숫자 uid 부분 (`"1000:1000"` → 1000)
    pub fn run_as_uid(&self) -> Option<i64> {
        let user = self.user.as_deref()?;
        user.split(':').next()?.trim().parse().ok()
    }
}

fn default_image() -> String {
    DEFAULT_WORKER_IMAGE.to_string()
}

fn default_workspace() -> String {
    DEFAULT_WORKER_WORKSPACE.to_string()
}

fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_falls_back_to_default() {
        let mut mapping = RepositoryMapping::default();
        mapping.repositories.insert(
            "acme/api".to_string(),
            RepositoryConfig {
                image: "node:20".to_string(),
                ..Default::default()
            },
        );

        assert_eq!(mapping.resolve("acme/api").image, "node:20");
        assert_eq!(mapping.resolve("acme/web").image, DEFAULT_WORKER_IMAGE);
    }

    #[test]
    fn test_env_pairs() {
        let repo = RepositoryConfig {
            env: vec!["A=1".into(), "B=x=y".into(), "EMPTY".into()],
            ..Default::default()
        };
        assert_eq!(
            repo.env_pairs(),
            vec![
                ("A".to_string(), "1".to_string()),
                ("B".to_string(), "x=y".to_string()),
                ("EMPTY".to_string(), String::new()),
            ]
        );
    }

    #[test]
    fn test_run_as_uid() {
        let mut sec = WorkerSecurity::default();
        assert_eq!(sec.run_as_uid(), None);
        sec.user = Some("1000:1000".into());
        assert_eq!(sec.run_as_uid(), Some(1000));
        sec.user = Some("worker".into());
        assert_eq!(sec.run_as_uid(), None);
    }
}

//! Error types for Relay
//!
//! 엔진 전체의 에러를 중앙에서 관리

use std::time::Duration;
use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// 사용자 메시지에 포함할 출력의 최대 길이 (bytes)
const MAX_OUTPUT_IN_MESSAGE: usize = 4000;

/// Relay 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    // ========================================================================
    // 설정 관련
    // ========================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    // ========================================================================
    // Worker 생명주기
    // ========================================================================
    #[error("No worker backend available: {}", .attempts.join("; "))]
    BackendUnavailable { attempts: Vec<String> },

    #[error("{backend} worker creation failed: {message}")]
    CreationFailed { backend: String, message: String },

    #[error("{backend} worker {worker} not ready after {}s", .timeout.as_secs())]
    ReadinessTimeout {
        backend: String,
        worker: String,
        timeout: Duration,
        logs: Option<String>,
    },

    #[error("Execution failed: {message}")]
    ExecutionFailed { message: String, output: String },

    #[error("Cleanup of worker {worker} failed: {message}")]
    CleanupFailed { worker: String, message: String },

    #[error("Invalid worker state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    // ========================================================================
    // 플랫폼 / 프로토콜
    // ========================================================================
    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Agent protocol error: {0}")]
    Protocol(String),

    #[error("Cancelled")]
    Cancelled,

    // ========================================================================
    // 일반
    // ========================================================================
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    // ========================================================================
    // 외부 에러 변환
    // ========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ========================================================================
    // 기타
    // ========================================================================
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// 다음 백엔드로 넘어가야 하는 에러인지 확인
    ///
    /// 생성 실패와 준비 시간 초과만 fallback 대상이다. 준비가 끝난 뒤의
    /// 실행 실패는 그대로 호출자에게 전달된다.
    pub fn triggers_fallback(&self) -> bool {
        matches!(
            self,
            Error::CreationFailed { .. } | Error::ReadinessTimeout { .. }
        )
    }

    /// 취소로 인한 에러인지 확인
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// 결과 보고용 사람이 읽을 수 있는 메시지
    ///
    /// 플랫폼 에러 원문 대신 요약을 돌려준다. 실행 실패는 캡처된 출력의
    /// 끝부분을 함께 포함한다.
    pub fn user_message(&self) -> String {
        match self {
            Error::Config(msg) => format!("The engine is misconfigured: {}", msg),
            Error::BackendUnavailable { attempts } => {
                if attempts.is_empty() {
                    "No execution environment is enabled for this task.".to_string()
                } else {
                    format!(
                        "No execution environment could be started for this task.\n\nAttempts:\n{}",
                        attempts
                            .iter()
                            .map(|a| format!("- {}", a))
                            .collect::<Vec<_>>()
                            .join("\n")
                    )
                }
            }
            Error::CreationFailed { backend, .. } => {
                format!("Could not create a {} worker for this task.", backend)
            }
            Error::ReadinessTimeout {
                backend, timeout, ..
            } => format!(
                "The {} worker did not become ready within {} seconds.",
                backend,
                timeout.as_secs()
            ),
            Error::ExecutionFailed { message, output } => {
                let mut text = format!("Execution failed: {}", message);
                let tail = output_tail(output, MAX_OUTPUT_IN_MESSAGE);
                if !tail.trim().is_empty() {
                    text.push_str("\n\nOutput:\n");
                    text.push_str(tail);
                }
                text
            }
            Error::Cancelled => "The task was cancelled before it finished.".to_string(),
            Error::InvalidInput(msg) => format!("Invalid task: {}", msg),
            _ => "An internal error occurred while processing the task.".to_string(),
        }
    }

    /// 생성 실패 에러 생성 헬퍼
    pub fn creation_failed(backend: impl Into<String>, message: impl Into<String>) -> Self {
        Error::CreationFailed {
            backend: backend.into(),
            message: message.into(),
        }
    }

    /// 실행 실패 에러 생성 헬퍼
    pub fn execution_failed(message: impl Into<String>, output: impl Into<String>) -> Self {
        Error::ExecutionFailed {
            message: message.into(),
            output: output.into(),
        }
    }

    /// 정리 실패 에러 생성 헬퍼
    pub fn cleanup_failed(worker: impl Into<String>, message: impl Into<String>) -> Self {
        Error::CleanupFailed {
            worker: worker.into(),
            message: message.into(),
        }
    }

    /// 플랫폼 에러 생성 헬퍼
    pub fn platform(message: impl std::fmt::Display) -> Self {
        Error::Platform(message.to_string())
    }
}

/// 문자열의 마지막 `max` bytes (char 경계 보존)
fn output_tail(output: &str, max: usize) -> &str {
    if output.len() <= max {
        return output;
    }
    let mut start = output.len() - max;
    while !output.is_char_boundary(start) {
        start += 1;
    }
    &output[start..]
}

// ============================================================================
// From 구현 (추가 변환)
// ============================================================================

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Internal(s)
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Internal(s.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fallback_classification() {
        assert!(Error::creation_failed("pod", "quota exceeded").triggers_fallback());
        assert!(Error::ReadinessTimeout {
            backend: "container".into(),
            worker: "w".into(),
            timeout: Duration::from_secs(5),
            logs: None,
        }
        .triggers_fallback());
        assert!(!Error::execution_failed("exit 1", "").triggers_fallback());
        assert!(!Error::Cancelled.triggers_fallback());
        assert!(!Error::cleanup_failed("w", "gone").triggers_fallback());
    }

    #[test]
    fn test_user_message_hides_platform_detail() {
        let err = Error::creation_failed("pod", "pods \"x\" is forbidden: long trace");
        let msg = err.user_message();
        assert!(msg.contains("pod worker"));
        assert!(!msg.contains("forbidden"));
    }

    #[test]
    fn test_user_message_includes_output_tail() {
        let output = format!("{}END", "x".repeat(10_000));
        let msg = Error::execution_failed("command exited with status 2", output).user_message();
        assert!(msg.contains("status 2"));
        assert!(msg.ends_with("END"));
        assert!(msg.len() < 5_000);
    }

    #[test]
    fn test_output_tail_char_boundary() {
        let s = "가나다라";
        let tail = output_tail(s, 4);
        assert_eq!(tail, "라");
    }

    #[test]
    fn test_backend_unavailable_lists_attempts() {
        let err = Error::BackendUnavailable {
            attempts: vec!["pod: creation failed".into(), "host: denied".into()],
        };
        assert!(err.to_string().contains("pod: creation failed; host: denied"));
        assert!(err.user_message().contains("- host: denied"));
    }
}

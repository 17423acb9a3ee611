//! In-worker exec protocol messages
//!
//! One JSON object per line in each direction:
//!
//! ```json
//! {"ownerId": "42", "command": "ls -la", "type": "exec"}
//! {"success": true, "output": "..."}
//! {"success": false, "output": "", "error": "owner mismatch: expected 42, got 7"}
//! ```

use crate::task::ExecutionResult;
use crate::transport::ExecOptions;
use relay_foundation::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Only supported request type
pub const EXEC_REQUEST_TYPE: &str = "exec";

/// Request sent to the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentRequest {
    /// Task id the sender believes the agent serves
    pub owner_id: String,

    pub command: String,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workdir: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
}

impl AgentRequest {
    /// Build an exec request
    pub fn exec(owner_id: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            owner_id: owner_id.into(),
            command: command.into(),
            kind: EXEC_REQUEST_TYPE.to_string(),
            stdin: None,
            workdir: None,
            env: BTreeMap::new(),
        }
    }

    /// Copy stdin, working directory and env from exec options
    pub fn with_options(mut self, options: &ExecOptions) -> Self {
        self.stdin = options.stdin.clone();
        self.workdir = options.workdir.clone();
        self.env = options.env.iter().cloned().collect();
        self
    }

    /// Exec options carried by this request
    pub fn options(&self) -> ExecOptions {
        ExecOptions {
            stdin: self.stdin.clone(),
            workdir: self.workdir.clone(),
            env: self.env.clone().into_iter().collect(),
        }
    }
}

/// Response returned by the agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub success: bool,

    #[serde(default)]
    pub output: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AgentResponse {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    /// Rejection or failure without executing anything
    pub fn rejected(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
        }
    }

    /// Convert into the transport result shape
    pub fn into_result(self) -> Result<String> {
        if self.success {
            Ok(self.output)
        } else {
            Err(Error::execution_failed(
                self.error
                    .unwrap_or_else(|| "agent reported failure".to_string()),
                self.output,
            ))
        }
    }
}

impl From<ExecutionResult> for AgentResponse {
    fn from(result: ExecutionResult) -> Self {
        Self {
            success: result.success,
            output: result.output,
            error: result.error_detail,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_format() {
        let request = AgentRequest::exec("42", "ls");
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"ownerId": "42", "command": "ls", "type": "exec"})
        );
    }

    #[test]
    fn test_request_options_survive_the_wire() {
        let options = ExecOptions::new()
            .with_stdin("input")
            .with_workdir("/workspace/sub")
            .with_env("A", "1");
        let request = AgentRequest::exec("42", "cat").with_options(&options);

        let line = serde_json::to_string(&request).unwrap();
        let parsed: AgentRequest = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed.options(), options);
    }

    #[test]
    fn test_response_error_is_optional() {
        let parsed: AgentResponse =
            serde_json::from_str(r#"{"success": true, "output": "hi"}"#).unwrap();
        assert_eq!(parsed, AgentResponse::ok("hi"));
        assert!(!serde_json::to_string(&parsed).unwrap().contains("error"));
    }

    #[test]
    fn test_failed_response_into_result() {
        let err = AgentResponse::rejected("owner mismatch").into_result().unwrap_err();
        assert!(matches!(err, Error::ExecutionFailed { ref message, .. } if message == "owner mismatch"));
    }
}

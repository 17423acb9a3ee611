//! Task definition and types

use relay_foundation::Error;
use serde::{Deserialize, Serialize};
use std::path::{Component, Path};

/// Default turn bound passed to the primary command
pub const DEFAULT_MAX_TURNS: u32 = 10;

/// Identifier of a task (the originating issue number)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Task ids name workspace directories, so each must be one normal path
    /// component: non-empty, no separators, not `.` or `..`.
    pub fn validate(&self) -> relay_foundation::Result<()> {
        let id = self.0.as_str();
        if id.trim().is_empty() {
            return Err(Error::InvalidInput("empty task id".to_string()));
        }

        let mut components = Path::new(id).components();
        let single = matches!(
            (components.next(), components.next()),
            (Some(Component::Normal(name)), None) if name == id
        );
        if !single || id.contains(['/', '\\']) {
            return Err(Error::InvalidInput(format!(
                "task id {:?} must be a single path component",
                id
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<u64> for TaskId {
    fn from(n: u64) -> Self {
        Self(n.to_string())
    }
}

/// Output format accepted by the primary command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
    StreamJson,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Text => "text",
            OutputFormat::Json => "json",
            OutputFormat::StreamJson => "stream-json",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            "stream-json" => Ok(OutputFormat::StreamJson),
            other => Err(format!("unknown output format: {}", other)),
        }
    }
}

/// A unit of requested work. Immutable once handed to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub id: TaskId,

    /// Free-text instruction for the primary command
    pub instruction_text: String,

    /// Target repository (`owner/repo`)
    pub target_repository: String,

    #[serde(default = "default_max_turns")]
    pub max_turns: u32,

    #[serde(default)]
    pub output_format: OutputFormat,
}

fn default_max_turns() -> u32 {
    DEFAULT_MAX_TURNS
}

impl Task {
    /// Create a new task with default turn bound and text output
    pub fn new(
        id: impl Into<TaskId>,
        instruction_text: impl Into<String>,
        target_repository: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            instruction_text: instruction_text.into(),
            target_repository: target_repository.into(),
            max_turns: DEFAULT_MAX_TURNS,
            output_format: OutputFormat::default(),
        }
    }

    /// Set max turns
    pub fn with_max_turns(mut self, max_turns: u32) -> Self {
        self.max_turns = max_turns;
        self
    }

    /// Set output format
    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }
}

/// Outcome of one command inside a worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error_detail: Option<String>,
}

impl ExecutionResult {
    /// Create a success result
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error_detail: None,
        }
    }

    /// Create a failure result
    pub fn failure(output: impl Into<String>, error_detail: impl Into<String>) -> Self {
        Self {
            success: false,
            output: output.into(),
            error_detail: Some(error_detail.into()),
        }
    }
}

impl From<relay_foundation::Result<String>> for ExecutionResult {
    fn from(result: relay_foundation::Result<String>) -> Self {
        match result {
            Ok(output) => Self::success(output),
            Err(relay_foundation::Error::ExecutionFailed { message, output }) => {
                Self::failure(output, message)
            }
            Err(e) => Self::failure(String::new(), e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_task_defaults() {
        let task = Task::new("42", "Hello", "acme/api");
        assert_eq!(task.id.as_str(), "42");
        assert_eq!(task.max_turns, DEFAULT_MAX_TURNS);
        assert_eq!(task.output_format, OutputFormat::Text);
    }

    #[test]
    fn test_task_id_validation() {
        for ok in ["42", "issue-7", "a.b", "..."] {
            assert!(TaskId::new(ok).validate().is_ok(), "{ok}");
        }
        for bad in ["", "  ", ".", "..", "../../escaped", "a/b", "/abs", "a\\b", "7/"] {
            assert!(
                matches!(TaskId::new(bad).validate(), Err(Error::InvalidInput(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_output_format_round_trip_names() {
        for format in [OutputFormat::Text, OutputFormat::Json, OutputFormat::StreamJson] {
            assert_eq!(format.as_str().parse::<OutputFormat>().unwrap(), format);
        }
        assert!("yaml".parse::<OutputFormat>().is_err());
    }

    #[test]
    fn test_task_serde_camel_case() {
        let task = Task::new(7u64, "do it", "a/b").with_output_format(OutputFormat::StreamJson);
        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["id"], "7");
        assert_eq!(json["instructionText"], "do it");
        assert_eq!(json["outputFormat"], "stream-json");
    }

    #[test]
    fn test_execution_result_from_error() {
        let result: ExecutionResult =
            Err(relay_foundation::Error::execution_failed("exit 3", "partial")).into();
        assert!(!result.success);
        assert_eq!(result.output, "partial");
        assert_eq!(result.error_detail.as_deref(), Some("exit 3"));
    }
}

//! Result reporting

use crate::task::TaskId;
use async_trait::async_trait;
use relay_foundation::Result;
use tracing::info;

/// Receives the final result of each task, exactly once per task
#[async_trait]
pub trait ResultReporter: Send + Sync {
    async fn post_result(&self, task_id: &TaskId, text: &str) -> Result<()>;
}

/// Writes results to the log
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

#[async_trait]
impl ResultReporter for LogReporter {
    async fn post_result(&self, task_id: &TaskId, text: &str) -> Result<()> {
        info!(task_id = %task_id, "Result:\n{}", text);
        Ok(())
    }
}

/// Success report body
pub fn success_report(task_id: &TaskId, output: &str) -> String {
    format!("Task #{} completed\n\n{}", task_id, output)
}

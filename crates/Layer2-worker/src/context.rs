//! Task context and primary command rendering

use crate::directive::DIRECTIVE_PREFIX;
use crate::task::Task;
use crate::worker::Worker;
use relay_foundation::{Error, Result};
use std::borrow::Cow;
use std::path::Path;

/// Text fed to the primary command on stdin
pub struct TaskContext<'a> {
    task: &'a Task,
    worker: &'a Worker,
    session_path: &'a Path,
}

impl<'a> TaskContext<'a> {
    pub fn new(task: &'a Task, worker: &'a Worker, session_path: &'a Path) -> Self {
        Self {
            task,
            worker,
            session_path,
        }
    }

    /// Render the context.
    ///
    /// No rendered line starts with the directive prefix, so echoing the
    /// context back never triggers a secondary command.
    pub fn render(&self) -> String {
        let task = self.task;
        let mut out = String::with_capacity(1024 + task.instruction_text.len());

        out.push_str("You are working on an automated task inside an isolated worker.\n\n");
        out.push_str(&format!("Issue ID: #{}\n", task.id));
        out.push_str(&format!("Repository: {}\n", task.target_repository));
        // Continuation lines are quoted so none can start with the prefix
        let instruction = task.instruction_text.replace('\n', "\n> ");
        out.push_str(&format!("Task: {}\n\n", instruction));

        out.push_str("## Environment\n");
        out.push_str(&format!(
            "- Working directory: {}\n",
            self.worker.workspace_path.display()
        ));
        out.push_str(&format!("- Worker: {} ({})\n", self.worker.id, self.worker.kind));
        out.push_str(&format!("- Session file: {}\n\n", self.session_path.display()));

        out.push_str("## Capabilities\n");
        out.push_str("- Read, create and modify files under the working directory.\n");
        out.push_str("- Run shell commands in this worker.\n");
        out.push_str(&format!(
            "- Request a follow-up command by printing a line that begins with \"{}\" followed by the command, one command per line.\n",
            DIRECTIVE_PREFIX
        ));
        out.push_str("  Follow-up commands run in order after you finish, in the same worker.\n\n");

        out.push_str("## Continuation\n");
        out.push_str("- This task may span several turns. Earlier progress is recorded in the session file.\n");
        out.push_str("- Resume from the recorded state instead of starting over.\n");
        out.push_str(&format!(
            "- Stop after at most {} turns and summarise what was done.\n",
            task.max_turns
        ));
        out
    }
}

/// Primary command template.
///
/// Placeholders: `{max_turns}`, `{output_format}`, `{session_file}`.
/// Substituted values are shell-quoted.
#[derive(Debug, Clone)]
pub struct PrimaryCommand {
    template: String,
}

impl PrimaryCommand {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    pub fn template(&self) -> &str {
        &self.template
    }

    /// Render the command for a task
    pub fn render(&self, task: &Task, session_path: &Path) -> Result<String> {
        let session = session_path.to_string_lossy();
        let max_turns = task.max_turns.to_string();

        let mut command = self.template.clone();
        for (placeholder, value) in [
            ("{max_turns}", max_turns.as_str()),
            ("{output_format}", task.output_format.as_str()),
            ("{session_file}", session.as_ref()),
        ] {
            if command.contains(placeholder) {
                command = command.replace(placeholder, &quote(value)?);
            }
        }
        Ok(command)
    }
}

fn quote(value: &str) -> Result<Cow<'_, str>> {
    shlex::try_quote(value)
        .map_err(|e| Error::InvalidInput(format!("cannot quote '{}': {}", value, e)))
}

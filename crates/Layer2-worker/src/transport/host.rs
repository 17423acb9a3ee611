//! Host transport - commands run as local subprocesses

#[cfg(unix)]
use crate::agent::{AgentClient, AgentRequest};
use crate::transport::{combine_output, ExecOptions};
use crate::worker::Worker;
#[cfg(unix)]
use relay_foundation::AGENT_SOCKET_PLACEHOLDER;
use relay_foundation::{Error, Result};
use std::path::Path;
#[cfg(unix)]
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
#[cfg(unix)]
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// Runs commands on the host, rooted at the worker workspace.
///
/// With an agent socket template set, commands are forwarded to the
/// in-worker agent of the target's task instead of being spawned directly.
#[derive(Clone, Default)]
pub struct HostTransport {
    /// Contains `{task_id}`; each agent serves a single task
    #[cfg(unix)]
    agent_socket: Option<Arc<String>>,
}

impl HostTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Route commands through per-task agents, e.g.
    /// `/tmp/relay-agent-{task_id}.sock`
    #[cfg(unix)]
    pub fn with_agent_socket(mut self, template: impl AsRef<Path>) -> Self {
        self.agent_socket = Some(Arc::new(template.as_ref().to_string_lossy().into_owned()));
        self
    }

    /// Socket of the agent serving `target`, if agent routing is on
    #[cfg(unix)]
    pub fn agent_socket_for(&self, target: &Worker) -> Option<PathBuf> {
        self.agent_socket.as_ref().map(|template| {
            PathBuf::from(template.replace(AGENT_SOCKET_PLACEHOLDER, target.task_id.as_str()))
        })
    }

    pub async fn run(&self, target: &Worker, command: &str, options: &ExecOptions) -> Result<String> {
        #[cfg(unix)]
        if let Some(socket) = self.agent_socket_for(target) {
            let options = options.clone().with_workdir(options.workdir_for(target));
            let request = AgentRequest::exec(target.task_id.as_str(), command)
                .with_options(&options);
            let response = AgentClient::new(socket).send(&request).await?;
            return response.into_result();
        }

        let workdir = options.workdir_for(target);
        run_local(&workdir, command, options).await
    }
}

/// Spawn `sh -c <command>` in `workdir` and collect combined output.
///
/// A non-zero exit is `ExecutionFailed` carrying the captured output.
pub async fn run_local(workdir: &Path, command: &str, options: &ExecOptions) -> Result<String> {
    let (shell, shell_arg) = if cfg!(windows) {
        ("cmd", "/C")
    } else {
        ("sh", "-c")
    };

    let mut cmd = Command::new(shell);
    cmd.arg(shell_arg)
        .arg(command)
        .current_dir(workdir)
        .stdin(if options.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    for (key, value) in &options.env {
        cmd.env(key, value);
    }

    debug!(workdir = %workdir.display(), "Executing: {}", command);

    let mut child = cmd
        .spawn()
        .map_err(|e| Error::execution_failed(format!("Failed to spawn process: {}", e), ""))?;

    // Feed stdin concurrently so a chatty child cannot deadlock on full pipes
    let writer = match (child.stdin.take(), options.stdin.clone()) {
        (Some(mut pipe), Some(input)) => Some(tokio::spawn(async move {
            pipe.write_all(input.as_bytes()).await
        })),
        _ => None,
    };

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| Error::execution_failed(format!("Process error: {}", e), ""))?;

    if let Some(writer) = writer {
        if let Ok(Err(e)) = writer.await {
            // The child may exit without reading all of its input
            debug!("stdin closed early: {}", e);
        }
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let content = combine_output(&stdout, &stderr);

    if output.status.success() {
        Ok(content)
    } else {
        Err(Error::execution_failed(describe_status(output.status), content))
    }
}

fn describe_status(status: ExitStatus) -> String {
    match status.code() {
        Some(code) => format!("command exited with status {}", code),
        None => "command terminated by signal".to_string(),
    }
}

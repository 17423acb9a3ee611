//! Agent server - runs inside a worker and executes commands for its owner
//!
//! Listens on a Unix domain socket. Each connection carries line-delimited
//! JSON requests; each request gets exactly one JSON response line.

use super::protocol::{AgentRequest, AgentResponse, EXEC_REQUEST_TYPE};
use crate::task::ExecutionResult;
use crate::transport::host::run_local;
use relay_foundation::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

/// Executes requests addressed to one owner, rooted at one workspace
#[derive(Debug, Clone)]
pub struct AgentServer {
    owner_id: String,
    workspace: PathBuf,
}

impl AgentServer {
    pub fn new(owner_id: impl Into<String>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            owner_id: owner_id.into(),
            workspace: workspace.into(),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    /// Validate and execute a single request.
    ///
    /// Requests for another owner, of an unknown type, or with an empty
    /// command are rejected without running anything.
    pub async fn handle(&self, request: &AgentRequest) -> AgentResponse {
        if request.owner_id != self.owner_id {
            warn!(
                expected = %self.owner_id,
                got = %request.owner_id,
                "Rejected request for another owner"
            );
            return AgentResponse::rejected(format!(
                "owner mismatch: expected {}, got {}",
                self.owner_id, request.owner_id
            ));
        }

        if request.kind != EXEC_REQUEST_TYPE {
            return AgentResponse::rejected(format!("unknown message type: {}", request.kind));
        }

        if request.command.trim().is_empty() {
            return AgentResponse::rejected("empty command");
        }

        let options = request.options();
        let workdir = match &options.workdir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.workspace.join(dir),
            None => self.workspace.clone(),
        };

        debug!(command = %request.command, "Executing agent request");
        ExecutionResult::from(run_local(&workdir, &request.command, &options).await).into()
    }

    /// Bind `socket_path` and serve until `cancel` fires.
    ///
    /// A stale socket file left by a previous agent is replaced.
    pub fn listen(
        self,
        socket_path: impl AsRef<Path>,
        cancel: CancellationToken,
    ) -> Result<JoinHandle<()>> {
        let socket_path = socket_path.as_ref().to_path_buf();
        if socket_path.exists() {
            std::fs::remove_file(&socket_path)?;
        }

        let listener = UnixListener::bind(&socket_path).map_err(|e| {
            Error::Protocol(format!(
                "failed to bind agent socket {}: {}",
                socket_path.display(),
                e
            ))
        })?;

        info!(socket = %socket_path.display(), owner = %self.owner_id, "Agent listening");

        let server = Arc::new(self);
        let handle = tokio::spawn(async move {
            let span = info_span!("agent_server", owner = %server.owner_id);
            async move {
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("Agent shutting down");
                            break;
                        }
                        accepted = listener.accept() => {
                            match accepted {
                                Ok((stream, _)) => {
                                    tokio::spawn(handle_connection(stream, Arc::clone(&server)));
                                }
                                Err(err) => warn!(%err, "Agent accept failed"),
                            }
                        }
                    }
                }
                let _ = std::fs::remove_file(&socket_path);
            }
            .instrument(span)
            .await;
        });

        Ok(handle)
    }
}

async fn handle_connection(stream: UnixStream, server: Arc<AgentServer>) {
    let span = info_span!("agent_conn");
    async move {
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();

        loop {
            line.clear();
            match reader.read_line(&mut line).await {
                Ok(0) => break,
                Ok(_) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    let response = match serde_json::from_str::<AgentRequest>(trimmed) {
                        Ok(request) => server.handle(&request).await,
                        Err(err) => AgentResponse::rejected(format!("invalid json: {}", err)),
                    };

                    let mut response_line = serde_json::to_string(&response).unwrap_or_else(|_| {
                        r#"{"success":false,"output":"","error":"serialization failed"}"#.to_owned()
                    });
                    response_line.push('\n');

                    if let Err(err) = writer.write_all(response_line.as_bytes()).await {
                        warn!(%err, "Failed to write agent response");
                        break;
                    }
                }
                Err(err) => {
                    warn!(%err, "Agent read error");
                    break;
                }
            }
        }

        debug!("Agent connection closed");
    }
    .instrument(span)
    .await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_owner_mismatch_is_rejected_without_running() {
        let dir = tempfile::tempdir().unwrap();
        let server = AgentServer::new("42", dir.path());
        let marker = dir.path().join("ran");

        let request = AgentRequest::exec("7", format!("touch {}", marker.display()));
        let response = server.handle(&request).await;

        assert!(!response.success);
        assert!(response.error.unwrap().contains("owner mismatch"));
        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn test_unknown_type_and_empty_command() {
        let dir = tempfile::tempdir().unwrap();
        let server = AgentServer::new("42", dir.path());

        let mut request = AgentRequest::exec("42", "echo hi");
        request.kind = "shutdown".into();
        let response = server.handle(&request).await;
        assert_eq!(response.error.as_deref(), Some("unknown message type: shutdown"));

        let response = server.handle(&AgentRequest::exec("42", "   ")).await;
        assert_eq!(response.error.as_deref(), Some("empty command"));
    }

    #[tokio::test]
    async fn test_exec_in_workspace() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let server = AgentServer::new("42", dir.path());

        let mut request = AgentRequest::exec("42", "pwd");
        request.workdir = Some(PathBuf::from("sub"));
        let response = server.handle(&request).await;

        assert!(response.success);
        let expected = std::fs::canonicalize(dir.path().join("sub")).unwrap();
        assert_eq!(response.output.trim(), expected.to_string_lossy());
    }

    #[tokio::test]
    async fn test_failed_command_reports_output() {
        let dir = tempfile::tempdir().unwrap();
        let server = AgentServer::new("42", dir.path());
        let response = server.handle(&AgentRequest::exec("42", "echo out; exit 1")).await;

        assert!(!response.success);
        assert_eq!(response.output, "out\n");
        assert!(response.error.unwrap().contains("status 1"));
    }
}

//! Agent client - sends exec requests to an in-worker agent

use super::protocol::{AgentRequest, AgentResponse};
use relay_foundation::{Error, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

/// Connects to an agent socket, one connection per request
#[derive(Debug, Clone)]
pub struct AgentClient {
    socket_path: Arc<PathBuf>,
}

impl AgentClient {
    pub fn new(socket_path: impl Into<PathBuf>) -> Self {
        Self {
            socket_path: Arc::new(socket_path.into()),
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Send one request and wait for its response line
    pub async fn send(&self, request: &AgentRequest) -> Result<AgentResponse> {
        let stream = UnixStream::connect(self.socket_path.as_ref())
            .await
            .map_err(|e| {
                Error::execution_failed(
                    format!(
                        "cannot reach agent at {}: {}",
                        self.socket_path.display(),
                        e
                    ),
                    "",
                )
            })?;

        let (reader, mut writer) = stream.into_split();

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await?;

        let mut reader = BufReader::new(reader);
        let mut response = String::new();
        let read = reader.read_line(&mut response).await?;
        if read == 0 {
            return Err(Error::Protocol(
                "agent closed the connection without responding".to_string(),
            ));
        }

        debug!(owner = %request.owner_id, "Agent responded");
        serde_json::from_str(response.trim())
            .map_err(|e| Error::Protocol(format!("invalid agent response: {}", e)))
    }
}

//! Exec transports
//!
//! Send a single shell-interpreted command into a worker and collect its
//! output:
//! - `HostTransport` - local `sh -c` subprocess, or the in-worker agent socket
//! - `ContainerTransport` - exec into a running container
//! - `PodTransport` - streaming remote exec into a pod

pub mod container;
pub mod host;
pub mod pod;

pub use container::ContainerTransport;
pub use host::HostTransport;
pub use pod::PodTransport;

use crate::worker::{BackendKind, Worker};
use relay_foundation::Result;
use std::path::PathBuf;

/// Separator between stdout and stderr in combined output
pub const STDERR_SEPARATOR: &str = "\n--- stderr ---\n";

/// Per-call execution options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Written to the command's stdin, then closed
    pub stdin: Option<String>,

    /// Overrides the worker workspace as working directory
    pub workdir: Option<PathBuf>,

    /// Added to the command environment
    pub env: Vec<(String, String)>,
}

impl ExecOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_stdin(mut self, stdin: impl Into<String>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(workdir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Working directory for a worker, honouring the override
    pub fn workdir_for(&self, worker: &Worker) -> PathBuf {
        self.workdir
            .clone()
            .unwrap_or_else(|| worker.workspace_path.clone())
    }
}

/// Join stdout and stderr the way every transport reports them
pub fn combine_output(stdout: &str, stderr: &str) -> String {
    let mut content = stdout.to_string();
    if !stderr.is_empty() {
        if !content.is_empty() {
            content.push_str(STDERR_SEPARATOR);
        }
        content.push_str(stderr);
    }
    content
}

/// Closed set of transports
#[derive(Clone)]
pub enum ExecTransport {
    Host(HostTransport),
    Container(ContainerTransport),
    Pod(PodTransport),
}

impl ExecTransport {
    pub fn kind(&self) -> BackendKind {
        match self {
            ExecTransport::Host(_) => BackendKind::Host,
            ExecTransport::Container(_) => BackendKind::Container,
            ExecTransport::Pod(_) => BackendKind::Pod,
        }
    }

    /// Run `command` in `target`, returning combined output.
    ///
    /// Failures are `Error::ExecutionFailed` carrying whatever output was
    /// captured.
    pub async fn run(&self, target: &Worker, command: &str, options: &ExecOptions) -> Result<String> {
        match self {
            ExecTransport::Host(t) => t.run(target, command, options).await,
            ExecTransport::Container(t) => t.run(target, command, options).await,
            ExecTransport::Pod(t) => t.run(target, command, options).await,
        }
    }
}

//! Container transport - exec into a running container

use crate::platform::ContainerRuntime;
use crate::transport::{combine_output, ExecOptions};
use crate::worker::Worker;
use relay_foundation::{Error, Result};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct ContainerTransport {
    runtime: Arc<dyn ContainerRuntime>,
}

impl ContainerTransport {
    pub fn new(runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self { runtime }
    }

    pub async fn run(&self, target: &Worker, command: &str, options: &ExecOptions) -> Result<String> {
        let mut options = options.clone();
        options.workdir = Some(options.workdir_for(target));

        debug!(container = %target.platform_ref, "Exec: {}", command);

        let output = self
            .runtime
            .exec(&target.platform_ref, command, &options)
            .await
            .map_err(|e| Error::execution_failed(e.to_string(), ""))?;

        let content = combine_output(&output.stdout, &output.stderr);
        if let Some(failure) = output.failure {
            return Err(Error::execution_failed(failure, content));
        }
        match output.exit_code {
            Some(0) => Ok(content),
            Some(code) => Err(Error::execution_failed(
                format!("command exited with status {}", code),
                content,
            )),
            None => Err(Error::execution_failed("exit status unavailable", content)),
        }
    }
}

//! Pod transport - remote exec into a pod
//!
//! The remote exec channel has no per-call working directory or
//! environment, so both are folded into the shell script. Stdin is inlined
//! as a quoted literal piped into the command.

use crate::platform::PodApi;
use crate::transport::{combine_output, ExecOptions};
use crate::worker::Worker;
use relay_foundation::{Error, Result};
use std::sync::Arc;
use tracing::debug;

#[derive(Clone)]
pub struct PodTransport {
    api: Arc<dyn PodApi>,
}

impl PodTransport {
    pub fn new(api: Arc<dyn PodApi>) -> Self {
        Self { api }
    }

    pub async fn run(&self, target: &Worker, command: &str, options: &ExecOptions) -> Result<String> {
        let script = build_script(target, command, options)?;
        debug!(pod = %target.platform_ref, "Exec: {}", command);

        let output = self
            .api
            .exec(&target.platform_ref, &script)
            .await
            .map_err(|e| Error::execution_failed(e.to_string(), ""))?;

        match output.failure {
            None => Ok(combine_output(&output.stdout, &output.stderr)),
            Some(failure) => {
                let message = if output.stderr.trim().is_empty() {
                    failure
                } else {
                    format!("{}; stderr: {}", failure, output.stderr.trim())
                };
                Err(Error::execution_failed(message, output.stdout))
            }
        }
    }
}

fn quote(value: &str) -> Result<String> {
    shlex::try_quote(value)
        .map(|q| q.into_owned())
        .map_err(|e| Error::InvalidInput(format!("cannot quote {:?}: {}", value, e)))
}

/// `cd <dir> && export K=V && <stdin pipe> (command)`
fn build_script(target: &Worker, command: &str, options: &ExecOptions) -> Result<String> {
    let workdir = options.workdir_for(target);
    let mut script = format!("cd {}", quote(&workdir.to_string_lossy())?);

    for (key, value) in &options.env {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(Error::InvalidInput(format!(
                "invalid environment variable name: {}",
                key
            )));
        }
        script.push_str(&format!(" && export {}={}", key, quote(value)?));
    }

    script.push_str(" && ");
    match &options.stdin {
        Some(stdin) => {
            script.push_str(&format!("printf '%s' {} | ({})", quote(stdin)?, command));
        }
        None => script.push_str(&format!("({}) < /dev/null", command)),
    }
    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskId;
    use crate::worker::BackendKind;

    fn worker() -> Worker {
        Worker::new(TaskId::new("5"), BackendKind::Pod, "relay-worker-5-abc", "/workspace")
    }

    #[test]
    fn test_script_without_stdin() {
        let script = build_script(&worker(), "ls -la", &ExecOptions::new()).unwrap();
        assert_eq!(script, "cd /workspace && (ls -la) < /dev/null");
    }

    #[test]
    fn test_script_with_env_and_stdin() {
        let options = ExecOptions::new()
            .with_env("SESSION_FILE", "/tmp/relay/issue 5.session")
            .with_stdin("it's here");
        let script = build_script(&worker(), "cat", &options).unwrap();
        assert!(script.starts_with("cd /workspace && export SESSION_FILE='/tmp/relay/issue 5.session'"));
        assert!(script.ends_with("| (cat)"));
        assert!(script.contains("printf '%s' "));
        assert!(!script.contains("< /dev/null"));
    }

    #[test]
    fn test_invalid_env_name_rejected() {
        let options = ExecOptions::new().with_env("BAD;NAME", "x");
        assert!(build_script(&worker(), "true", &options).is_err());
    }
}

//! Command line interface

use anyhow::Context;
use clap::{Parser, Subcommand};
use relay_foundation::RelayConfig;
use relay_worker::{
    DispatchPool, LogReporter, OutputFormat, Task, TaskDispatcher, DEFAULT_MAX_TURNS,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Relay - run issue tasks inside ephemeral workers
#[derive(Parser, Debug)]
#[command(name = "relay")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Config file (JSON or TOML); defaults to ~/.config/relay/config.json
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Dispatch a single task and print its output
    Run {
        /// Task identifier (issue number)
        #[arg(long)]
        id: String,

        /// Target repository (owner/repo)
        #[arg(long)]
        repo: String,

        #[arg(long, default_value_t = DEFAULT_MAX_TURNS)]
        max_turns: u32,

        /// text, json or stream-json
        #[arg(long, default_value = "text")]
        output_format: OutputFormat,

        /// Instruction text
        instruction: String,
    },
    /// Dispatch every task in a JSON array file through the bounded pool
    Batch {
        file: PathBuf,
    },
    /// Serve exec requests inside a worker
    #[cfg(unix)]
    Agent {
        /// Only requests for this owner are executed
        #[arg(long)]
        owner: String,

        #[arg(long)]
        socket: PathBuf,

        #[arg(long, default_value = ".")]
        workspace: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

pub async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(args.config.as_deref())?;

    match args.command {
        Command::Run {
            id,
            repo,
            max_turns,
            output_format,
            instruction,
        } => {
            let task = Task::new(id, instruction, repo)
                .with_max_turns(max_turns)
                .with_output_format(output_format);
            run_task(&config, task).await
        }
        Command::Batch { file } => {
            let tasks = read_tasks(&file).await?;
            run_batch(&config, tasks).await
        }
        #[cfg(unix)]
        Command::Agent {
            owner,
            socket,
            workspace,
        } => run_agent(owner, socket, workspace).await,
        Command::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

/// Load the config file, then apply environment overrides
pub fn load_config(path: Option<&Path>) -> anyhow::Result<RelayConfig> {
    let mut config = match path {
        Some(path) => RelayConfig::load(path)?,
        None => RelayConfig::load_global()?,
    };
    config.apply_env()?;
    Ok(config)
}

pub async fn read_tasks(path: &Path) -> anyhow::Result<Vec<Task>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    let tasks = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse tasks in {}", path.display()))?;
    Ok(tasks)
}

/// Cancel the returned token on Ctrl-C
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling");
            trigger.cancel();
        }
    });
    cancel
}

async fn run_task(config: &RelayConfig, task: Task) -> anyhow::Result<()> {
    let dispatcher = TaskDispatcher::from_config(config, Arc::new(LogReporter)).await?;
    let cancel = cancel_on_interrupt();

    let result = dispatcher.dispatch(&task, &cancel).await;
    let remaining = dispatcher.shutdown().await;
    if remaining > 0 {
        warn!(remaining, "Workers torn down at exit");
    }

    let output = result?;
    print!("{}", output);
    Ok(())
}

async fn run_batch(config: &RelayConfig, tasks: Vec<Task>) -> anyhow::Result<()> {
    let dispatcher = TaskDispatcher::from_config(config, Arc::new(LogReporter)).await?;
    let pool = DispatchPool::new(Arc::new(dispatcher), config.pool.max_concurrent);
    info!(tasks = tasks.len(), max_concurrent = config.pool.max_concurrent, "Batch started");

    let handles: Vec<_> = tasks.into_iter().map(|task| pool.submit(task)).collect();
    let cancel = cancel_on_interrupt();
    let mut interrupted = false;
    let mut failed = 0usize;

    for handle in handles {
        let task_id = handle.task_id().clone();
        let wait = handle.wait();
        tokio::pin!(wait);

        let result = loop {
            tokio::select! {
                result = &mut wait => break result,
                () = cancel.cancelled(), if !interrupted => {
                    interrupted = true;
                    pool.shutdown().await;
                }
            }
        };

        if let Err(e) = result {
            warn!(task_id = %task_id, "Task failed: {}", e);
            failed += 1;
        }
    }

    pool.shutdown().await;
    if failed > 0 {
        anyhow::bail!("{} task(s) failed", failed);
    }
    Ok(())
}

#[cfg(unix)]
async fn run_agent(owner: String, socket: PathBuf, workspace: PathBuf) -> anyhow::Result<()> {
    let cancel = cancel_on_interrupt();
    let handle = relay_worker::AgentServer::new(owner, workspace).listen(&socket, cancel)?;
    handle.await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_run() {
        let args = Args::try_parse_from([
            "relay",
            "run",
            "--id",
            "42",
            "--repo",
            "acme/api",
            "--output-format",
            "stream-json",
            "Fix the build",
        ])
        .unwrap();

        match args.command {
            Command::Run {
                id,
                repo,
                max_turns,
                output_format,
                instruction,
            } => {
                assert_eq!(id, "42");
                assert_eq!(repo, "acme/api");
                assert_eq!(max_turns, DEFAULT_MAX_TURNS);
                assert_eq!(output_format, OutputFormat::StreamJson);
                assert_eq!(instruction, "Fix the build");
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }

    #[test]
    fn test_parse_rejects_unknown_format() {
        let result = Args::try_parse_from([
            "relay",
            "run",
            "--id",
            "1",
            "--repo",
            "a/b",
            "--output-format",
            "xml",
            "x",
        ]);
        assert!(result.is_err());
    }

    #[test]
    fn test_load_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.toml");
        std::fs::write(&path, "[pool]\nmaxConcurrent = 2\n").unwrap();

        let config = load_config(Some(path.as_path())).unwrap();
        assert_eq!(config.pool.max_concurrent, 2);
    }

    #[tokio::test]
    async fn test_read_tasks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.json");
        std::fs::write(
            &path,
            r#"[
                {"id": "1", "instructionText": "a", "targetRepository": "acme/api"},
                {"id": "2", "instructionText": "b", "targetRepository": "acme/web",
                 "maxTurns": 3, "outputFormat": "json"}
            ]"#,
        )
        .unwrap();

        let tasks = read_tasks(&path).await.unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].max_turns, DEFAULT_MAX_TURNS);
        assert_eq!(tasks[1].output_format, OutputFormat::Json);
    }
}

//! Dispatch pool - bounded concurrent task submission

use crate::dispatcher::TaskDispatcher;
use crate::task::{Task, TaskId};
use relay_foundation::{Error, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Runs dispatches on their own tokio tasks, at most `max_concurrent` at a
/// time. Submissions past the limit wait for a permit.
pub struct DispatchPool {
    dispatcher: Arc<TaskDispatcher>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
    max_concurrent: usize,
}

impl DispatchPool {
    pub fn new(dispatcher: Arc<TaskDispatcher>, max_concurrent: usize) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            dispatcher,
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            cancel: CancellationToken::new(),
            max_concurrent,
        }
    }

    pub fn dispatcher(&self) -> &Arc<TaskDispatcher> {
        &self.dispatcher
    }

    /// Dispatches currently holding a permit
    pub fn running(&self) -> usize {
        self.max_concurrent - self.semaphore.available_permits()
    }

    /// Start a dispatch. The result is reported through the dispatcher's
    /// reporter and also returned by the handle.
    pub fn submit(&self, task: Task) -> DispatchHandle {
        let task_id = task.id.clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let semaphore = Arc::clone(&self.semaphore);
        let cancel = self.cancel.child_token();

        let handle = tokio::spawn(async move {
            // A closed pool has also cancelled `cancel`, so the dispatch
            // ends early but still reports
            let _permit = semaphore.acquire_owned().await.ok();
            debug!(task_id = %task.id, "Dispatch started");
            dispatcher.dispatch(&task, &cancel).await
        });

        DispatchHandle { task_id, handle }
    }

    /// Cancel in-flight dispatches, stop accepting permits and tear down
    /// any remaining workers
    pub async fn shutdown(&self) -> usize {
        info!("Shutting down dispatch pool");
        self.cancel.cancel();
        self.semaphore.close();
        self.dispatcher.shutdown().await
    }
}

/// Handle to a submitted dispatch
pub struct DispatchHandle {
    task_id: TaskId,
    handle: JoinHandle<Result<String>>,
}

impl DispatchHandle {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait for the dispatch to finish
    pub async fn wait(self) -> Result<String> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => Err(Error::Internal(format!(
                "dispatch of task {} aborted: {}",
                self.task_id, e
            ))),
        }
    }
}

//! Session registry - continuation sessions per task
//!
//! Maps a task id to the file the primary command uses to resume a
//! multi-turn conversation. Entries are created once and never removed
//! here; retention is handled outside the engine.

use crate::task::TaskId;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use relay_foundation::Result;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Snapshot of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub task_id: TaskId,
    pub session_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

struct SessionEntry {
    task_id: TaskId,
    path: PathBuf,
    created_at: DateTime<Utc>,
    last_used: Mutex<DateTime<Utc>>,
    storage: OnceCell<()>,
}

impl SessionEntry {
    fn snapshot(&self) -> Session {
        Session {
            task_id: self.task_id.clone(),
            session_path: self.path.clone(),
            created_at: self.created_at,
            last_used: *self.last_used.lock(),
        }
    }
}

/// Concurrency-safe task id → session store
#[derive(Clone)]
pub struct SessionRegistry {
    root: Arc<PathBuf>,
    entries: Arc<RwLock<HashMap<TaskId, Arc<SessionEntry>>>>,
}

impl SessionRegistry {
    /// Create a registry storing session files under `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Arc::new(root.into()),
            entries: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Session file path for a task id
    pub fn path_for(&self, task_id: &TaskId) -> PathBuf {
        self.root.join(format!("issue-{}.session", task_id))
    }

    /// Get the session path for a task, creating the entry and its backing
    /// file on first use.
    pub async fn get_or_create(&self, task_id: &TaskId) -> Result<PathBuf> {
        let entry = self.entry(task_id);

        entry
            .storage
            .get_or_try_init(|| async {
                if let Some(parent) = entry.path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&entry.path)
                    .await?;
                info!(task_id = %task_id, path = %entry.path.display(), "Session created");
                Ok::<_, relay_foundation::Error>(())
            })
            .await?;

        Ok(entry.path.clone())
    }

    fn entry(&self, task_id: &TaskId) -> Arc<SessionEntry> {
        if let Some(entry) = self.entries.read().get(task_id) {
            return Arc::clone(entry);
        }

        let mut entries = self.entries.write();
        let entry = entries.entry(task_id.clone()).or_insert_with(|| {
            let now = Utc::now();
            Arc::new(SessionEntry {
                task_id: task_id.clone(),
                path: self.path_for(task_id),
                created_at: now,
                last_used: Mutex::new(now),
                storage: OnceCell::new(),
            })
        });
        Arc::clone(entry)
    }

    /// Update last-used time. Each call yields a strictly later timestamp.
    /// Unknown task ids are ignored.
    pub fn touch(&self, task_id: &TaskId) {
        let entry = match self.entries.read().get(task_id) {
            Some(entry) => Arc::clone(entry),
            None => {
                debug!(task_id = %task_id, "Touch on unknown session ignored");
                return;
            }
        };

        let mut last_used = entry.last_used.lock();
        let now = Utc::now();
        *last_used = if now > *last_used {
            now
        } else {
            *last_used + chrono::Duration::nanoseconds(1)
        };
    }

    /// Snapshot of a session
    pub fn get(&self, task_id: &TaskId) -> Option<Session> {
        self.entries.read().get(task_id).map(|e| e.snapshot())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

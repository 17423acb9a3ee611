//! Active-worker registry
//!
//! Task id → the live worker serving it. Acquisition is an atomic
//! get-or-insert: concurrent dispatches of the same task id share one
//! worker, each holding a `WorkerLease`. The last lease released tears the
//! worker down. While a worker is being torn down its slot is draining and
//! new acquirers wait for it to finish, so at most one non-deleted worker
//! exists per task id.

use crate::backend::Backend;
use crate::task::TaskId;
use crate::worker::Worker;
use parking_lot::RwLock;
use relay_foundation::Result;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, OnceCell};
use tracing::{debug, info, warn};

/// A ready worker and the backend that owns it
#[derive(Clone)]
pub struct ActiveWorker {
    pub worker: Arc<Worker>,
    pub backend: Backend,
}

struct Slot {
    cell: OnceCell<ActiveWorker>,
    /// Only changed while holding the map's write lock
    leases: AtomicUsize,
    draining: AtomicBool,
    drained: watch::Sender<bool>,
}

impl Slot {
    fn new() -> Self {
        let (drained, _) = watch::channel(false);
        Self {
            cell: OnceCell::new(),
            leases: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            drained,
        }
    }
}

/// Concurrency-safe task id → active worker store
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    slots: Arc<RwLock<HashMap<TaskId, Arc<Slot>>>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease the worker for `task_id`, running `init` to create one if none
    /// is active.
    ///
    /// Concurrent callers for the same id run `init` at most once between
    /// them. If `init` fails the error is returned and a later caller may
    /// try again.
    pub async fn acquire<F, Fut>(&self, task_id: &TaskId, init: F) -> Result<WorkerLease>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<ActiveWorker>>,
    {
        let slot = loop {
            let mut waiting = {
                let mut slots = self.slots.write();
                match slots.get(task_id) {
                    Some(slot) if slot.draining.load(Ordering::SeqCst) => slot.drained.subscribe(),
                    Some(slot) => {
                        slot.leases.fetch_add(1, Ordering::SeqCst);
                        break Arc::clone(slot);
                    }
                    None => {
                        let slot = Arc::new(Slot::new());
                        slot.leases.fetch_add(1, Ordering::SeqCst);
                        slots.insert(task_id.clone(), Arc::clone(&slot));
                        break slot;
                    }
                }
            };

            debug!(task_id = %task_id, "Waiting for previous worker teardown");
            // Sender dropped means the slot is gone, which is just as good
            let _ = waiting.wait_for(|drained| *drained).await;
        };

        let mut lease = WorkerLease {
            registry: self.clone(),
            task_id: task_id.clone(),
            slot,
            released: false,
        };

        match lease.slot.cell.get_or_try_init(init).await {
            Ok(active) => {
                debug!(task_id = %task_id, worker = %active.worker.id, "Worker leased");
            }
            Err(e) => {
                lease.released = true;
                release_slot(self.clone(), task_id.clone(), Arc::clone(&lease.slot)).await;
                return Err(e);
            }
        }

        Ok(lease)
    }

    /// The active worker for a task id, if one is ready
    pub fn get(&self, task_id: &TaskId) -> Option<ActiveWorker> {
        let slots = self.slots.read();
        let slot = slots.get(task_id)?;
        if slot.draining.load(Ordering::SeqCst) {
            return None;
        }
        slot.cell.get().cloned()
    }

    /// Snapshot of all ready, non-draining workers
    pub fn active_workers(&self) -> Vec<ActiveWorker> {
        self.slots
            .read()
            .values()
            .filter(|slot| !slot.draining.load(Ordering::SeqCst))
            .filter_map(|slot| slot.cell.get().cloned())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.active_workers().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tear down every ready worker, leased or not. Returns how many were
    /// deleted.
    ///
    /// A worker still being created is left to its lease holders.
    pub async fn shutdown(&self) -> usize {
        let slots = self.claim(|_| true);
        info!(workers = slots.len(), "Shutting down active workers");
        self.retire(slots).await
    }

    /// Tear down workers older than `max_age`, even ones still leased.
    /// Returns how many were deleted.
    pub async fn cleanup_stale(&self, max_age: Duration) -> usize {
        let max_age = chrono::Duration::from_std(max_age).unwrap_or(chrono::Duration::MAX);
        let stale = self.claim(|active| active.worker.age() > max_age);
        if !stale.is_empty() {
            info!(workers = stale.len(), "Cleaning up stale workers");
        }
        self.retire(stale).await
    }

    /// Mark ready, non-draining slots matching `pick` as draining. They stay
    /// in the map so acquirers wait until `retire` is done with them.
    fn claim<P>(&self, pick: P) -> Vec<(TaskId, Arc<Slot>)>
    where
        P: Fn(&ActiveWorker) -> bool,
    {
        let slots = self.slots.write();
        let claimed = slots
            .iter()
            .filter(|(_, slot)| !slot.draining.load(Ordering::SeqCst))
            .filter(|(_, slot)| slot.cell.get().is_some_and(&pick))
            .map(|(id, slot)| {
                slot.draining.store(true, Ordering::SeqCst);
                (id.clone(), Arc::clone(slot))
            })
            .collect();
        claimed
    }

    async fn retire(&self, slots: Vec<(TaskId, Arc<Slot>)>) -> usize {
        let mut deleted = 0;
        for (task_id, slot) in slots {
            if let Some(active) = slot.cell.get() {
                match active.backend.teardown(&active.worker).await {
                    Ok(true) => deleted += 1,
                    Ok(false) => {}
                    Err(e) => warn!(task_id = %task_id, "{}", e),
                }
            }
            remove_slot(self, &task_id, &slot);
        }
        deleted
    }
}

/// A hold on the active worker of one task.
///
/// Release it with [`WorkerLease::release`]; dropping an unreleased lease
/// schedules the release on the current runtime.
pub struct WorkerLease {
    registry: WorkerRegistry,
    task_id: TaskId,
    slot: Arc<Slot>,
    released: bool,
}

impl WorkerLease {
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// The leased worker
    pub fn active(&self) -> Option<&ActiveWorker> {
        self.slot.cell.get()
    }

    /// Give up the lease. The last holder tears the worker down before
    /// this returns.
    pub async fn release(mut self) {
        self.released = true;
        release_slot(
            self.registry.clone(),
            self.task_id.clone(),
            Arc::clone(&self.slot),
        )
        .await;
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let registry = self.registry.clone();
        let task_id = self.task_id.clone();
        let slot = Arc::clone(&self.slot);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(release_slot(registry, task_id, slot));
            }
            Err(_) => warn!(task_id = %task_id, "Lease dropped outside a runtime; worker not released"),
        }
    }
}

async fn release_slot(registry: WorkerRegistry, task_id: TaskId, slot: Arc<Slot>) {
    // Whoever flips `draining` owns the teardown; a retired slot already has one
    let owner = {
        let _slots = registry.slots.write();
        let previous = slot.leases.fetch_sub(1, Ordering::SeqCst);
        previous == 1 && !slot.draining.swap(true, Ordering::SeqCst)
    };

    if !owner {
        return;
    }

    if let Some(active) = slot.cell.get() {
        if let Err(e) = active.backend.teardown(&active.worker).await {
            warn!(task_id = %task_id, "{}", e);
        }
    }

    remove_slot(&registry, &task_id, &slot);
}

/// Drop a torn-down slot from the map and wake acquirers waiting on it
fn remove_slot(registry: &WorkerRegistry, task_id: &TaskId, slot: &Arc<Slot>) {
    {
        let mut slots = registry.slots.write();
        if slots
            .get(task_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            slots.remove(task_id);
        }
    }
    slot.drained.send_replace(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HostBackend;
    use crate::state::WorkerState;
    use crate::task::Task;
    use std::sync::atomic::AtomicUsize;

    async fn host_worker(backend: &Backend, id: &str) -> Result<ActiveWorker> {
        let worker = backend
            .create(&Task::new(TaskId::new(id), "x", "acme/api"))
            .await?;
        Ok(ActiveWorker {
            worker,
            backend: backend.clone(),
        })
    }

    #[tokio::test]
    async fn test_reuse_while_leased() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::Host(HostBackend::new(dir.path()));
        let registry = WorkerRegistry::new();
        let id = TaskId::new("1");
        let inits = AtomicUsize::new(0);

        let first = registry
            .acquire(&id, || {
                inits.fetch_add(1, Ordering::SeqCst);
                host_worker(&backend, "1")
            })
            .await
            .unwrap();
        let second = registry
            .acquire(&id, || {
                inits.fetch_add(1, Ordering::SeqCst);
                host_worker(&backend, "1")
            })
            .await
            .unwrap();

        assert_eq!(inits.load(Ordering::SeqCst), 1);
        let worker = Arc::clone(&first.active().unwrap().worker);
        assert!(Arc::ptr_eq(&worker, &second.active().unwrap().worker));

        first.release().await;
        assert_eq!(worker.state(), WorkerState::Created);
        assert_eq!(registry.len(), 1);

        second.release().await;
        assert_eq!(worker.state(), WorkerState::Deleted);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_failed_init_leaves_no_slot() {
        let registry = WorkerRegistry::new();
        let id = TaskId::new("2");
        let result = registry
            .acquire(&id, || async {
                Err(relay_foundation::Error::BackendUnavailable { attempts: vec![] })
            })
            .await;
        assert!(result.is_err());
        assert!(registry.slots.read().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_tears_down_everything() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::Host(HostBackend::new(dir.path()));
        let registry = WorkerRegistry::new();

        let lease = registry
            .acquire(&TaskId::new("3"), || host_worker(&backend, "3"))
            .await
            .unwrap();
        let worker = Arc::clone(&lease.active().unwrap().worker);

        assert_eq!(registry.shutdown().await, 1);
        assert_eq!(worker.state(), WorkerState::Deleted);

        // Releasing afterwards does not delete again
        lease.release().await;
        assert_eq!(worker.state(), WorkerState::Deleted);
    }

    #[tokio::test]
    async fn test_cleanup_stale() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Backend::Host(HostBackend::new(dir.path()));
        let registry = WorkerRegistry::new();

        let lease = registry
            .acquire(&TaskId::new("4"), || host_worker(&backend, "4"))
            .await
            .unwrap();

        assert_eq!(registry.cleanup_stale(Duration::from_secs(3600)).await, 0);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.cleanup_stale(Duration::ZERO).await, 1);
        assert!(registry.is_empty());
        lease.release().await;
    }
}

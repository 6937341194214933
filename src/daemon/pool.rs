//! Worker pool.
//!
//! ```text
//! spawn --> Busy --idle--> Idle --acquire--> Busy
//!             \                 \
//!              +------exit-------+--> Dead (removed)
//! ```
//!
//! `acquire` returns an idle worker, spawns one while the pool is below its
//! cap, and otherwise waits until a worker goes idle or dies.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Dead,
}

/// Starts worker processes.
#[async_trait]
pub trait Spawner: Send + Sync {
    type Handle: Send + Sync;

    async fn spawn(&self, id: u32) -> Result<Self::Handle>;
}

/// A worker handed out by [`WorkerPool::acquire`], marked Busy.
pub struct Lease<H> {
    pub id: u32,
    pub handle: Arc<H>,
}

struct Slot<H> {
    handle: Arc<H>,
    state: WorkerState,
}

struct Inner<H> {
    workers: BTreeMap<u32, Slot<H>>,
    /// Spawns in flight, counted against the cap.
    spawning: usize,
    closed: bool,
}

pub struct WorkerPool<S: Spawner> {
    spawner: S,
    max: usize,
    inner: Mutex<Inner<S::Handle>>,
    changed: Notify,
    next_id: AtomicU32,
}

impl<S: Spawner> WorkerPool<S> {
    pub fn new(spawner: S, max: usize) -> Self {
        Self {
            spawner,
            max: max.max(1),
            inner: Mutex::new(Inner {
                workers: BTreeMap::new(),
                spawning: 0,
                closed: false,
            }),
            changed: Notify::new(),
            next_id: AtomicU32::new(1),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner<S::Handle>> {
        // A panic while holding the guard leaves plain bookkeeping behind.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Get a worker for a new session, waiting while the pool is full.
    pub async fn acquire(&self) -> Result<Lease<S::Handle>> {
        loop {
            // Registered before the check so a `close` in between still wakes us.
            let notified = self.changed.notified();
            let spawn_id = {
                let mut inner = self.inner();
                if inner.closed {
                    bail!("worker pool is shut down");
                }
                let idle = inner
                    .workers
                    .iter_mut()
                    .find(|(_, slot)| slot.state == WorkerState::Idle);
                if let Some((&id, slot)) = idle {
                    slot.state = WorkerState::Busy;
                    return Ok(Lease {
                        id,
                        handle: slot.handle.clone(),
                    });
                }
                if inner.workers.len() + inner.spawning < self.max {
                    inner.spawning += 1;
                    Some(self.next_id.fetch_add(1, Ordering::Relaxed))
                } else {
                    None
                }
            };

            match spawn_id {
                Some(id) => return self.spawn_busy(id).await,
                None => {
                    tracing::debug!("All {} workers busy, waiting", self.max);
                    notified.await;
                }
            }
        }
    }

    async fn spawn_busy(&self, id: u32) -> Result<Lease<S::Handle>> {
        let spawned = self.spawner.spawn(id).await;
        let mut inner = self.inner();
        inner.spawning -= 1;
        match spawned {
            Ok(handle) => {
                let handle = Arc::new(handle);
                inner.workers.insert(
                    id,
                    Slot {
                        handle: handle.clone(),
                        state: WorkerState::Busy,
                    },
                );
                tracing::info!("Spawned worker {} ({} of {})", id, inner.workers.len(), self.max);
                Ok(Lease { id, handle })
            }
            Err(e) => {
                drop(inner);
                // The slot is free again for someone else.
                self.changed.notify_one();
                Err(e.context(format!("Failed to spawn worker {}", id)))
            }
        }
    }

    /// The worker finished its session.
    pub fn release(&self, id: u32) {
        let mut inner = self.inner();
        match inner.workers.get_mut(&id) {
            Some(slot) if slot.state == WorkerState::Busy => {
                slot.state = WorkerState::Idle;
                drop(inner);
                tracing::debug!("Worker {} is idle", id);
                self.changed.notify_one();
            }
            Some(_) => tracing::warn!("Worker {} reported idle twice", id),
            None => tracing::debug!("Idle report from unknown worker {}", id),
        }
    }

    /// The worker process is gone. Returns its state at the time.
    pub fn mark_dead(&self, id: u32) -> WorkerState {
        let removed = self.inner().workers.remove(&id);
        match removed {
            Some(slot) => {
                if slot.state == WorkerState::Busy {
                    tracing::warn!("Worker {} died with a session in flight", id);
                } else {
                    tracing::info!("Worker {} exited", id);
                }
                self.changed.notify_one();
                slot.state
            }
            None => WorkerState::Dead,
        }
    }

    pub fn state(&self, id: u32) -> WorkerState {
        self.inner()
            .workers
            .get(&id)
            .map(|slot| slot.state)
            .unwrap_or(WorkerState::Dead)
    }

    /// (idle, busy)
    pub fn counts(&self) -> (usize, usize) {
        let inner = self.inner();
        let idle = inner
            .workers
            .values()
            .filter(|s| s.state == WorkerState::Idle)
            .count();
        (idle, inner.workers.len() - idle)
    }

    pub fn handle(&self, id: u32) -> Option<Arc<S::Handle>> {
        self.inner().workers.get(&id).map(|s| s.handle.clone())
    }

    pub fn is_closed(&self) -> bool {
        self.inner().closed
    }

    /// Wait until every worker has exited.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.changed.notified();
            if self.inner().workers.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Stop handing out workers. Returns the idle ones so the caller can
    /// tell them to exit.
    pub fn close(&self) -> Vec<(u32, Arc<S::Handle>)> {
        let mut inner = self.inner();
        inner.closed = true;
        let idle = inner
            .workers
            .iter()
            .filter(|(_, s)| s.state == WorkerState::Idle)
            .map(|(&id, s)| (id, s.handle.clone()))
            .collect();
        drop(inner);
        self.changed.notify_waiters();
        idle
    }
}

//! Lock service used by the request dispatcher.
//!
//! The dispatcher only sees [`LockService`]: "give me this lock, wake me when
//! it is mine". [`LocalLocks`] implements it directly on a shared
//! [`LockManager`]; the daemon's workers implement it by forwarding to the
//! parent process, which runs a `LocalLocks` of its own.

use crate::error::{CvsError, LockError, Result};
use crate::repo::{LockGrant, LockKind, LockManager, LockOutcome, OwnerId, RepoNodeId};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::oneshot;

#[async_trait]
pub trait LockService: Send {
    /// Acquire a lock, waiting while it is queued.
    async fn lock(&mut self, owner: OwnerId, path: &str, kind: LockKind) -> Result<()>;

    async fn unlock(&mut self, owner: OwnerId, path: &str) -> Result<()>;

    /// Drop every lock and queued request of `owner`.
    async fn release_all(&mut self, owner: OwnerId) -> Result<()>;
}

struct Shared {
    manager: LockManager,
    waiters: HashMap<(OwnerId, RepoNodeId), oneshot::Sender<()>>,
}

impl Shared {
    fn deliver(&mut self, grants: Vec<LockGrant>) {
        for grant in grants {
            match self.waiters.remove(&(grant.owner, grant.node)) {
                Some(tx) => {
                    if tx.send(()).is_err() {
                        tracing::debug!("Waiter {} went away before its grant", grant.owner);
                    }
                }
                None => tracing::warn!("Grant for {} has no waiter", grant.owner),
            }
        }
    }

    /// Resolve a directory path, materializing nodes for directories created
    /// since the tree was loaded.
    fn resolve(&mut self, path: &str) -> Result<RepoNodeId> {
        match self.manager.tree().find(path)? {
            Some(id) => Ok(id),
            None => {
                tracing::debug!("Adding repository node {}", path);
                self.manager.tree_mut().ensure_dir_path(path)
            }
        }
    }
}

/// In-process lock service over a shared [`LockManager`]. Cloning shares the
/// manager.
#[derive(Clone)]
pub struct LocalLocks {
    shared: Arc<Mutex<Shared>>,
    timeout: Option<Duration>,
}

impl LocalLocks {
    pub fn new(manager: LockManager, timeout: Option<Duration>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Shared {
                manager,
                waiters: HashMap::new(),
            })),
            timeout,
        }
    }

    fn shared(&self) -> Result<MutexGuard<'_, Shared>> {
        self.shared
            .lock()
            .map_err(|_| LockError::Unavailable("lock table poisoned".into()).into())
    }

    /// Release everything held or awaited by any session of `worker` (the
    /// worker died).
    pub fn release_worker(&self, worker: u32) -> Result<usize> {
        let mut shared = self.shared()?;
        let owners: Vec<OwnerId> = shared
            .waiters
            .keys()
            .map(|(o, _)| *o)
            .chain(
                shared
                    .manager
                    .tree()
                    .ids()
                    .flat_map(|id| {
                        let st = shared.manager.state(id);
                        st.writer()
                            .into_iter()
                            .chain(st.readers())
                            .chain(st.waiting())
                            .collect::<Vec<_>>()
                    }),
            )
            .filter(|o| o.worker == worker)
            .collect();

        let mut released = 0;
        let mut seen = std::collections::HashSet::new();
        for owner in owners {
            if !seen.insert(owner) {
                continue;
            }
            released += shared.manager.held_by(owner).len();
            shared.waiters.retain(|(o, _), _| *o != owner);
            let grants = shared.manager.release_all(owner);
            shared.deliver(grants);
        }
        if released > 0 {
            tracing::warn!("Released {} locks left by worker {}", released, worker);
        }
        Ok(released)
    }

    /// Run `f` against the lock manager (inspection, tests).
    pub fn with_manager<T>(&self, f: impl FnOnce(&LockManager) -> T) -> Result<T> {
        Ok(f(&self.shared()?.manager))
    }
}

#[async_trait]
impl LockService for LocalLocks {
    async fn lock(&mut self, owner: OwnerId, path: &str, kind: LockKind) -> Result<()> {
        let (node, rx) = {
            let mut shared = self.shared()?;
            let node = shared.resolve(path)?;
            match shared.manager.lock(node, kind, owner) {
                LockOutcome::Granted => return Ok(()),
                LockOutcome::Queued => {
                    let (tx, rx) = oneshot::channel();
                    shared.waiters.insert((owner, node), tx);
                    (node, rx)
                }
            }
        };

        tracing::info!("{} waiting for {:?} lock on {}", owner, kind, path);
        let waited = match self.timeout {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(r) => r,
                Err(_) => {
                    // Withdraw; if the grant raced in, this releases it instead.
                    let mut shared = self.shared()?;
                    shared.waiters.remove(&(owner, node));
                    if let Ok(grants) = shared.manager.unlock(node, owner) {
                        shared.deliver(grants);
                    }
                    return Err(LockError::Timeout(path.to_string()).into());
                }
            },
            None => rx.await,
        };
        waited.map_err(|_| {
            CvsError::from(LockError::Unavailable(format!(
                "request for {} was cancelled",
                path
            )))
        })
    }

    async fn unlock(&mut self, owner: OwnerId, path: &str) -> Result<()> {
        let mut shared = self.shared()?;
        let node = shared
            .manager
            .tree()
            .find(path)?
            .ok_or_else(|| LockError::NoSuchNode(path.to_string()))?;
        let grants = shared.manager.unlock(node, owner)?;
        shared.deliver(grants);
        Ok(())
    }

    async fn release_all(&mut self, owner: OwnerId) -> Result<()> {
        let mut shared = self.shared()?;
        shared.waiters.retain(|(o, _), _| *o != owner);
        let grants = shared.manager.release_all(owner);
        shared.deliver(grants);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{LoadOptions, RepoTree};
    use std::fs;
    use tempfile::TempDir;

    fn locks(timeout: Option<Duration>) -> (TempDir, LocalLocks) {
        let tmp = TempDir::new().unwrap();
        fs::create_dir_all(tmp.path().join("mod")).unwrap();
        let tree = RepoTree::load(tmp.path(), LoadOptions::default()).unwrap();
        (tmp, LocalLocks::new(LockManager::new(tree), timeout))
    }

    const A: OwnerId = OwnerId { worker: 1, session: 1 };
    const B: OwnerId = OwnerId { worker: 2, session: 1 };

    #[tokio::test]
    async fn test_queued_writer_is_woken() {
        let (_tmp, locks) = locks(None);
        let mut a = locks.clone();
        let mut b = locks.clone();

        a.lock(A, "mod", LockKind::Write).await.unwrap();
        let waiter = tokio::spawn(async move {
            b.lock(B, "mod", LockKind::Write).await.unwrap();
            b
        });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        a.unlock(A, "mod").await.unwrap();
        let _b = waiter.await.unwrap();
        let writer = locks
            .with_manager(|m| {
                let id = m.tree().find("mod").unwrap().unwrap();
                m.state(id).writer()
            })
            .unwrap();
        assert_eq!(writer, Some(B));
    }

    #[tokio::test]
    async fn test_timeout_withdraws_request() {
        let (_tmp, locks) = locks(Some(Duration::from_millis(20)));
        let mut a = locks.clone();
        let mut b = locks.clone();

        a.lock(A, "mod", LockKind::Write).await.unwrap();
        let err = b.lock(B, "mod", LockKind::Read).await.unwrap_err();
        assert!(matches!(err, CvsError::Lock(LockError::Timeout(_))));

        let pending = locks
            .with_manager(|m| {
                let id = m.tree().find("mod").unwrap().unwrap();
                m.state(id).pending_len()
            })
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_unknown_directory_is_materialized() {
        let (_tmp, locks) = locks(None);
        let mut a = locks.clone();
        a.lock(A, "mod/new/dir", LockKind::Read).await.unwrap();
        a.release_all(A).await.unwrap();
        assert!(locks
            .with_manager(|m| m.tree().find("mod/new/dir").unwrap().is_some())
            .unwrap());
    }

    #[tokio::test]
    async fn test_release_worker_frees_and_cancels() {
        let (_tmp, locks) = locks(None);
        let mut a = locks.clone();
        let mut b = locks.clone();

        a.lock(A, "mod", LockKind::Write).await.unwrap();
        let waiter = tokio::spawn(async move { b.lock(B, "mod", LockKind::Write).await });
        tokio::task::yield_now().await;

        // Worker 1 dies: B is promoted.
        assert_eq!(locks.release_worker(1).unwrap(), 1);
        waiter.await.unwrap().unwrap();

        // Worker 2 dies while holding: nothing stays locked.
        locks.release_worker(2).unwrap();
        let free = locks
            .with_manager(|m| {
                let id = m.tree().find("mod").unwrap().unwrap();
                m.state(id).is_free()
            })
            .unwrap();
        assert!(free);
    }
}

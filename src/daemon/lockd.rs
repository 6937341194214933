//! Parent side of a worker's control channel.
//!
//! Workers never touch the lock table themselves. Each `Lock`, `Unlock` and
//! `ReleaseAll` arrives here and is answered with `Granted` or `Refused`.
//! When the channel reaches end of stream the worker is gone. Lock requests
//! still in flight are cancelled first, then everything its sessions held is
//! released before the pool hears about it.

use super::control::{Channel, Message};
use crate::error::{CvsError, LockError};
use crate::repo::OwnerId;
use crate::server::{LocalLocks, LockService};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Idle(u32),
    Dead(u32),
}

fn reply_for(result: crate::error::Result<()>) -> Message {
    match result {
        Ok(()) => Message::Granted,
        Err(CvsError::Lock(e)) => Message::Refused(e),
        Err(e) => Message::Refused(LockError::Unavailable(e.to_string())),
    }
}

async fn reply(channel: &Channel, worker: u32, msg: Message) {
    if let Err(e) = channel.send(&msg).await {
        tracing::debug!("Cannot answer worker {}: {}", worker, e);
    }
}

fn check_owner(worker: u32, owner: OwnerId) -> Option<Message> {
    (owner.worker != worker).then(|| {
        tracing::warn!("Worker {} sent a request for {}", worker, owner);
        Message::Refused(LockError::Unavailable(format!("{} is not a session of this worker", owner)))
    })
}

/// Answer one worker until its channel closes, then release its locks.
pub async fn serve_worker(worker: u32, channel: Arc<Channel>, locks: LocalLocks, events: mpsc::UnboundedSender<PoolEvent>) {
    let mut pending: JoinSet<()> = JoinSet::new();
    loop {
        let received = tokio::select! {
            Some(done) = pending.join_next(), if !pending.is_empty() => {
                if let Err(e) = done {
                    tracing::error!("Lock request of worker {} failed: {}", worker, e);
                }
                continue;
            }
            received = channel.recv() => received,
        };
        let msg = match received {
            Ok(Some((msg, fd))) => {
                if fd.is_some() {
                    tracing::warn!("Worker {} sent a descriptor; closing it", worker);
                }
                msg
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!("Control channel of worker {} failed: {}", worker, e);
                break;
            }
        };

        match msg {
            Message::Idle => {
                if events.send(PoolEvent::Idle(worker)).is_err() {
                    break;
                }
            }
            Message::Lock { owner, path, kind } => {
                if let Some(refusal) = check_owner(worker, owner) {
                    reply(&channel, worker, refusal).await;
                    continue;
                }
                // Queued requests wait in their own task so a dying worker
                // is still noticed.
                let channel = channel.clone();
                let mut locks = locks.clone();
                pending.spawn(async move {
                    let result = locks.lock(owner, &path, kind).await;
                    tracing::debug!("{:?} lock on {} for {}: {:?}", kind, path, owner, result.is_ok());
                    reply(&channel, worker, reply_for(result)).await;
                });
            }
            Message::Unlock { owner, path } => {
                let msg = match check_owner(worker, owner) {
                    Some(refusal) => refusal,
                    None => reply_for(locks.clone().unlock(owner, &path).await),
                };
                reply(&channel, worker, msg).await;
            }
            Message::ReleaseAll { owner } => {
                let msg = match check_owner(worker, owner) {
                    Some(refusal) => refusal,
                    None => reply_for(locks.clone().release_all(owner).await),
                };
                reply(&channel, worker, msg).await;
            }
            other => tracing::warn!("Unexpected message from worker {}: {:?}", worker, other),
        }
    }

    // A request that is cancelled here either never reached the table or
    // left a grant or queue entry that release_worker removes.
    pending.shutdown().await;
    if let Err(e) = locks.release_worker(worker) {
        tracing::error!("Cannot release locks of worker {}: {}", worker, e);
    }
    if events.send(PoolEvent::Dead(worker)).is_err() {
        tracing::debug!("Pool gone before worker {} was reaped", worker);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::daemon::control::ControlSocket;
    use crate::daemon::worker::RemoteLocks;
    use crate::repo::{LoadOptions, LockKind, LockManager, RepoTree};
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn lock_table() -> (TempDir, LocalLocks) {
        let tmp = TempDir::new().unwrap();
        fs::create_dir(tmp.path().join("mod")).unwrap();
        let tree = RepoTree::load(tmp.path(), LoadOptions::default()).unwrap();
        (tmp, LocalLocks::new(LockManager::new(tree), None))
    }

    fn connect(worker: u32, locks: &LocalLocks, events: &mpsc::UnboundedSender<PoolEvent>) -> RemoteLocks {
        let (parent, child) = ControlSocket::pair().unwrap();
        let parent = Arc::new(Channel::new(parent).unwrap());
        tokio::spawn(serve_worker(worker, parent, locks.clone(), events.clone()));
        RemoteLocks::new(Arc::new(Channel::new(child).unwrap()))
    }

    #[tokio::test]
    async fn test_dead_worker_releases_write_lock() {
        let (_tmp, locks) = lock_table();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let mut first = connect(1, &locks, &tx);
        first.lock(OwnerId::new(1, 1), "mod", LockKind::Write).await.unwrap();

        let mut second = connect(2, &locks, &tx);
        let waiting = tokio::spawn(async move {
            second.lock(OwnerId::new(2, 1), "mod", LockKind::Write).await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiting.is_finished());

        // Worker 1 crashes mid-session.
        drop(first);
        assert_eq!(rx.recv().await, Some(PoolEvent::Dead(1)));
        tokio::time::timeout(Duration::from_secs(5), waiting)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    fn writer_of(locks: &LocalLocks, path: &str) -> Option<OwnerId> {
        locks
            .with_manager(|m| {
                let id = m.tree().find(path).unwrap().unwrap();
                m.state(id).writer()
            })
            .unwrap()
    }

    #[tokio::test]
    async fn test_lock_request_in_flight_at_exit_is_released() {
        let (_tmp, locks) = lock_table();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (parent, child) = ControlSocket::pair().unwrap();
        tokio::spawn(serve_worker(7, Arc::new(Channel::new(parent).unwrap()), locks.clone(), tx));

        child
            .send(
                &Message::Lock {
                    owner: OwnerId::new(7, 1),
                    path: "mod".into(),
                    kind: LockKind::Write,
                },
                None,
            )
            .unwrap();
        drop(child);

        assert_eq!(rx.recv().await, Some(PoolEvent::Dead(7)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(writer_of(&locks, "mod"), None);
        assert!(locks.with_manager(|m| m.held_by(OwnerId::new(7, 1)).is_empty()).unwrap());
    }

    #[tokio::test]
    async fn test_queued_request_of_dead_worker_is_never_granted() {
        let (_tmp, locks) = lock_table();
        let holder = OwnerId::new(1, 1);
        let mut local = locks.clone();
        local.lock(holder, "mod", LockKind::Write).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let (parent, child) = ControlSocket::pair().unwrap();
        tokio::spawn(serve_worker(7, Arc::new(Channel::new(parent).unwrap()), locks.clone(), tx));
        child
            .send(
                &Message::Lock {
                    owner: OwnerId::new(7, 1),
                    path: "mod".into(),
                    kind: LockKind::Write,
                },
                None,
            )
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        drop(child);
        assert_eq!(rx.recv().await, Some(PoolEvent::Dead(7)));

        local.unlock(holder, "mod").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(writer_of(&locks, "mod"), None);
        let pending = locks
            .with_manager(|m| {
                let id = m.tree().find("mod").unwrap().unwrap();
                m.state(id).pending_len()
            })
            .unwrap();
        assert_eq!(pending, 0);
    }

    #[tokio::test]
    async fn test_foreign_owner_refused() {
        let (_tmp, locks) = lock_table();
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut remote = connect(1, &locks, &tx);
        let err = remote
            .lock(OwnerId::new(9, 1), "mod", LockKind::Read)
            .await
            .unwrap_err();
        assert!(matches!(err, CvsError::Lock(LockError::Unavailable(_))));
    }

    #[tokio::test]
    async fn test_unlock_and_release_round_trip() {
        let (_tmp, locks) = lock_table();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut remote = connect(4, &locks, &tx);
        let owner = OwnerId::new(4, 2);

        remote.lock(owner, ".", LockKind::Read).await.unwrap();
        remote.lock(owner, "mod", LockKind::Read).await.unwrap();
        remote.unlock(owner, "mod").await.unwrap();
        remote.release_all(owner).await.unwrap();
        assert!(locks.with_manager(|m| m.held_by(owner).is_empty()).unwrap());

        let err = remote.unlock(owner, "mod").await.unwrap_err();
        assert!(matches!(err, CvsError::Lock(LockError::NotHeld { .. })));

        remote.idle().await.unwrap();
        assert_eq!(rx.recv().await, Some(PoolEvent::Idle(4)));
    }
}

//! Reader/writer locks on repository nodes with a FIFO wait queue.
//!
//! A read lock is granted while no writer holds the node and no write
//! request waits ahead of it. A write lock is granted only when nobody else
//! holds or awaits the node. Anything else queues. When a lock is released the queue
//! head is promoted for as long as it is satisfiable, and every promotion is
//! returned to the caller as a [`LockGrant`] so the waiting session can be
//! woken.

use super::tree::{RepoNodeId, RepoTree};
use crate::error::{CvsError, LockError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, VecDeque};
use std::fmt;

/// Identity of a lock holder: the worker process and its session number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerId {
    pub worker: u32,
    pub session: u64,
}

impl OwnerId {
    pub fn new(worker: u32, session: u64) -> Self {
        Self { worker, session }
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}.s{}", self.worker, self.session)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockKind {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LockOutcome {
    Granted,
    Queued,
}

/// A queued request that has just been granted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockGrant {
    pub owner: OwnerId,
    pub node: RepoNodeId,
    pub kind: LockKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pending {
    owner: OwnerId,
    kind: LockKind,
}

#[derive(Debug, Default)]
pub struct LockState {
    writer: Option<OwnerId>,
    readers: BTreeSet<OwnerId>,
    pending: VecDeque<Pending>,
}

impl LockState {
    pub fn writer(&self) -> Option<OwnerId> {
        self.writer
    }

    pub fn readers(&self) -> impl Iterator<Item = OwnerId> + '_ {
        self.readers.iter().copied()
    }

    /// Owners with a queued request, in queue order.
    pub fn waiting(&self) -> impl Iterator<Item = OwnerId> + '_ {
        self.pending.iter().map(|p| p.owner)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_free(&self) -> bool {
        self.writer.is_none() && self.readers.is_empty() && self.pending.is_empty()
    }

    fn holds(&self, owner: OwnerId) -> bool {
        self.writer == Some(owner) || self.readers.contains(&owner)
    }

    fn is_waiting(&self, owner: OwnerId) -> bool {
        self.pending.iter().any(|p| p.owner == owner)
    }

    /// Readers other than `owner` (an owner's own read never blocks its write).
    fn only_reader_is(&self, owner: OwnerId) -> bool {
        self.readers.iter().all(|r| *r == owner)
    }

    fn can_grant(&self, kind: LockKind, owner: OwnerId) -> bool {
        match kind {
            LockKind::Read => {
                self.writer.is_none() && !self.pending.iter().any(|p| p.kind == LockKind::Write)
            }
            LockKind::Write => {
                self.writer.is_none() && self.only_reader_is(owner) && self.pending.is_empty()
            }
        }
    }

    fn grant(&mut self, owner: OwnerId, kind: LockKind) {
        match kind {
            LockKind::Read => {
                self.readers.insert(owner);
            }
            LockKind::Write => {
                self.readers.remove(&owner);
                self.writer = Some(owner);
            }
        }
    }

    /// Grant the queue head repeatedly while it is satisfiable.
    fn promote(&mut self) -> Vec<(OwnerId, LockKind)> {
        let mut granted = Vec::new();
        while let Some(head) = self.pending.front().copied() {
            let ok = match head.kind {
                LockKind::Read => self.writer.is_none(),
                LockKind::Write => self.writer.is_none() && self.only_reader_is(head.owner),
            };
            if !ok {
                break;
            }
            self.pending.pop_front();
            self.grant(head.owner, head.kind);
            granted.push((head.owner, head.kind));
        }
        granted
    }

    /// At most one writer, and never a writer alongside readers.
    pub fn is_consistent(&self) -> bool {
        !(self.writer.is_some() && !self.readers.is_empty())
    }
}

/// Owns the repository tree and arbitrates locks on its nodes.
#[derive(Debug)]
pub struct LockManager {
    tree: RepoTree,
}

impl LockManager {
    pub fn new(tree: RepoTree) -> Self {
        Self { tree }
    }

    pub fn tree(&self) -> &RepoTree {
        &self.tree
    }

    pub fn tree_mut(&mut self) -> &mut RepoTree {
        &mut self.tree
    }

    pub fn state(&self, node: RepoNodeId) -> &LockState {
        &self.tree.node(node).lock
    }

    fn resolve(&self, path: &str) -> Result<RepoNodeId> {
        self.tree
            .find(path)?
            .ok_or_else(|| CvsError::Lock(LockError::NoSuchNode(path.to_string())))
    }

    /// Request a lock; either granted now or queued behind earlier requests.
    ///
    /// Asking again for a lock already held (or already queued) is a no-op.
    /// A reader asking for write keeps its read until the write is granted.
    /// Upgrading while another owner also reads or waits can deadlock, so
    /// sessions drop their reads before taking write locks.
    pub fn lock(&mut self, node: RepoNodeId, kind: LockKind, owner: OwnerId) -> LockOutcome {
        let path = self.tree.path(node);
        let st = &mut self.tree.node_mut(node).lock;

        if st.writer == Some(owner) || (kind == LockKind::Read && st.readers.contains(&owner)) {
            tracing::warn!("{} already holds a lock on {}", owner, path);
            return LockOutcome::Granted;
        }
        if st.is_waiting(owner) {
            tracing::warn!("{} is already waiting on {}", owner, path);
            return LockOutcome::Queued;
        }
        if st.can_grant(kind, owner) {
            st.grant(owner, kind);
            tracing::trace!("{:?} lock on {} granted to {}", kind, path, owner);
            LockOutcome::Granted
        } else {
            st.pending.push_back(Pending { owner, kind });
            tracing::debug!(
                "{:?} lock on {} for {} queued ({} waiting)",
                kind,
                path,
                owner,
                st.pending.len()
            );
            LockOutcome::Queued
        }
    }

    pub fn lock_path(&mut self, path: &str, kind: LockKind, owner: OwnerId) -> Result<LockOutcome> {
        let node = self.resolve(path)?;
        Ok(self.lock(node, kind, owner))
    }

    /// Release whatever `owner` holds or awaits on `node`.
    ///
    /// Releasing a write lock held by someone else is a permission error.
    /// Returns the queued requests promoted as a result.
    pub fn unlock(&mut self, node: RepoNodeId, owner: OwnerId) -> Result<Vec<LockGrant>> {
        let path = self.tree.path(node);
        let st = &mut self.tree.node_mut(node).lock;

        if st.readers.remove(&owner) {
            tracing::trace!("Read lock on {} released by {}", path, owner);
        } else if st.writer == Some(owner) {
            st.writer = None;
            tracing::trace!("Write lock on {} released by {}", path, owner);
        } else if let Some(pos) = st.pending.iter().position(|p| p.owner == owner) {
            st.pending.remove(pos);
            tracing::debug!("{} withdrew its request on {}", owner, path);
        } else if let Some(holder) = st.writer {
            return Err(CvsError::Permission(format!(
                "{} cannot release the write lock on {} held by {}",
                owner, path, holder
            )));
        } else {
            return Err(CvsError::Lock(LockError::NotHeld { path, owner: owner.to_string() }));
        }

        Ok(self.promote(node))
    }

    pub fn unlock_path(&mut self, path: &str, owner: OwnerId) -> Result<Vec<LockGrant>> {
        let node = self.resolve(path)?;
        self.unlock(node, owner)
    }

    /// Drop every lock and queued request belonging to `owner`.
    pub fn release_all(&mut self, owner: OwnerId) -> Vec<LockGrant> {
        let touched: Vec<RepoNodeId> = self
            .tree
            .ids()
            .filter(|&id| {
                let st = &self.tree.node(id).lock;
                st.holds(owner) || st.is_waiting(owner)
            })
            .collect();

        let mut grants = Vec::new();
        for id in touched {
            let st = &mut self.tree.node_mut(id).lock;
            st.readers.remove(&owner);
            if st.writer == Some(owner) {
                st.writer = None;
            }
            st.pending.retain(|p| p.owner != owner);
            grants.extend(self.promote(id));
        }
        if !grants.is_empty() {
            tracing::debug!("Releasing {} promoted {} waiters", owner, grants.len());
        }
        grants
    }

    /// Nodes on which `owner` currently holds a lock.
    pub fn held_by(&self, owner: OwnerId) -> Vec<RepoNodeId> {
        self.tree
            .ids()
            .filter(|&id| self.tree.node(id).lock.holds(owner))
            .collect()
    }

    fn promote(&mut self, node: RepoNodeId) -> Vec<LockGrant> {
        let granted = self.tree.node_mut(node).lock.promote();
        granted
            .into_iter()
            .map(|(owner, kind)| {
                tracing::trace!("{:?} lock on {} promoted to {}", kind, self.tree.path(node), owner);
                LockGrant { owner, node, kind }
            })
            .collect()
    }

    pub fn is_consistent(&self) -> bool {
        self.tree.ids().all(|id| self.tree.node(id).lock.is_consistent())
    }
}

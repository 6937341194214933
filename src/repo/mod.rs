//! Repository tree and the lock manager that arbitrates access to it.

pub mod lock;
pub mod tree;

pub use lock::{LockGrant, LockKind, LockManager, LockOutcome, OwnerId};
pub use tree::{LoadOptions, RepoKind, RepoNode, RepoNodeId, RepoTree};

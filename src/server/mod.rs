//! Server mode - runs when invoked as `rcvs server <repository>`
//!
//! Speaks the protocol over stdin/stdout for one client (the `:ext:` and
//! `:local:` methods). Locks are kept in-process; the daemon uses the same
//! dispatcher with locks held by its parent process instead.

pub mod commands;
pub mod dispatch;
pub mod locks;
pub mod session;
pub mod store;

pub use commands::{CommandArgs, CommandContext, CommandExecutor, DefaultExecutor, Response, UpdateKind};
pub use dispatch::{serve_session, ServerEnv};
pub use locks::{LocalLocks, LockService};
pub use session::{Claim, DirState, GlobalOptions, Session};
pub use store::{BinaryDiff, DiffEngine, HeadStore, MemoryStore, Revision, RevisionStore, StoreEntry};

use crate::protocol::Connection;
use crate::repo::{LoadOptions, LockManager, OwnerId, RepoTree};
use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Expand tilde (~) in paths to the user's home directory.
pub fn expand_tilde(path: &Path) -> PathBuf {
    let path_str = path.to_string_lossy();

    if path_str == "~" {
        dirs::home_dir().unwrap_or_else(|| PathBuf::from("."))
    } else if let Some(rest) = path_str.strip_prefix("~/") {
        match dirs::home_dir() {
            Some(home) => home.join(rest),
            None => path.to_path_buf(),
        }
    } else {
        path.to_path_buf()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ServerOptions {
    pub check_permissions: bool,
    pub lock_timeout: Option<Duration>,
}

/// Main server entry point
pub async fn run_server(repository: &Path, opts: ServerOptions) -> Result<()> {
    let repository = expand_tilde(repository);
    let tree = RepoTree::load(
        &repository,
        LoadOptions {
            check_permissions: opts.check_permissions,
        },
    )
    .with_context(|| format!("Cannot open repository {}", repository.display()))?;
    tracing::debug!("Loaded {} repository nodes from {}", tree.len(), repository.display());

    let mut locks = LocalLocks::new(LockManager::new(tree), opts.lock_timeout);
    let env = ServerEnv::new(
        Arc::new(HeadStore::new(&repository)),
        Arc::new(DefaultExecutor::default()),
    )
    .with_root(repository.to_string_lossy());

    let mut conn = Connection::new(tokio::io::stdin(), tokio::io::stdout());
    serve_session(&mut conn, &env, &mut locks, OwnerId::new(std::process::id(), 1)).await
}

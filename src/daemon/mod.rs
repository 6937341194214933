//! `rcvs daemon`: accept TCP clients and hand each connection to a pooled,
//! chrooted worker process.
//!
//! The parent never speaks the protocol. It owns the listener, the worker
//! pool and the lock table; workers receive the accepted socket over their
//! control channel and ask the parent for every lock.

pub mod control;
pub mod lockd;
pub mod pool;
pub mod worker;

pub use control::{Channel, ControlSocket, Message};
pub use lockd::PoolEvent;
pub use pool::{Lease, Spawner, WorkerPool, WorkerState};
pub use worker::{run_worker, RemoteLocks, CONTROL_FD, WORKER_CONFIG_ENV};

use crate::config::DaemonConfig;
use crate::repo::{LoadOptions, LockManager, RepoTree};
use crate::server::LocalLocks;
use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::unistd::{chown, dup2};
use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Command;
use tokio::sync::mpsc;

/// The parent's view of one worker process.
#[derive(Debug)]
pub struct WorkerHandle {
    pub id: u32,
    pub pid: Option<u32>,
    channel: Arc<Channel>,
}

impl WorkerHandle {
    /// Pass an accepted client connection to the worker. The parent's copy
    /// of the socket is closed when this returns.
    pub async fn dispatch(&self, seq: u64, stream: TcpStream) -> Result<()> {
        let stream = stream.into_std()?;
        self.channel
            .send_fd(&Message::Session { seq }, Some(stream.as_raw_fd()))
            .await
            .with_context(|| format!("Failed to hand session {} to worker {}", seq, self.id))
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.channel.send(&Message::Shutdown).await?;
        Ok(())
    }
}

/// Re-executes this binary as `rcvs worker`.
pub struct ProcessSpawner {
    exe: PathBuf,
    config_text: String,
    verbosity: u8,
    locks: LocalLocks,
    events: mpsc::UnboundedSender<PoolEvent>,
}

impl ProcessSpawner {
    pub fn new(
        config: &DaemonConfig,
        verbosity: u8,
        locks: LocalLocks,
        events: mpsc::UnboundedSender<PoolEvent>,
    ) -> Result<Self> {
        Ok(Self {
            exe: std::env::current_exe().context("Cannot locate own executable")?,
            config_text: toml::to_string(config).context("Failed to encode worker configuration")?,
            verbosity,
            locks,
            events,
        })
    }
}

#[async_trait]
impl Spawner for ProcessSpawner {
    type Handle = WorkerHandle;

    async fn spawn(&self, id: u32) -> Result<WorkerHandle> {
        let (parent_end, child_end) = ControlSocket::pair()?;
        let child_fd = child_end.as_raw_fd();

        let mut cmd = Command::new(&self.exe);
        for _ in 0..self.verbosity {
            cmd.arg("-v");
        }
        cmd.arg("worker").arg("--id").arg(id.to_string());
        cmd.env(WORKER_CONFIG_ENV, &self.config_text);
        cmd.stdin(Stdio::null());
        cmd.stdout(Stdio::null());
        cmd.stderr(Stdio::inherit());
        // SAFETY: runs between fork and exec and only calls dup2/fcntl,
        // which are async-signal-safe and do not allocate.
        unsafe {
            cmd.pre_exec(move || {
                if child_fd == CONTROL_FD {
                    fcntl(child_fd, FcntlArg::F_SETFD(FdFlag::empty()))?;
                } else {
                    dup2(child_fd, CONTROL_FD)?;
                }
                Ok(())
            });
        }

        let mut child = cmd.spawn().context("Failed to start worker process")?;
        drop(child_end);
        let pid = child.id();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if status.success() => tracing::debug!("Worker {} exited", id),
                Ok(status) => tracing::warn!("Worker {} exited with {}", id, status),
                Err(e) => tracing::warn!("Cannot reap worker {}: {}", id, e),
            }
        });

        let channel = Arc::new(Channel::new(parent_end)?);
        tokio::spawn(lockd::serve_worker(id, channel.clone(), self.locks.clone(), self.events.clone()));
        Ok(WorkerHandle { id, pid, channel })
    }
}

async fn hand_off<S>(pool: &WorkerPool<S>, seq: u64, stream: TcpStream) -> Result<()>
where
    S: Spawner<Handle = WorkerHandle>,
{
    let lease = pool.acquire().await?;
    tracing::debug!("Session {} goes to worker {}", seq, lease.id);
    lease.handle.dispatch(seq, stream).await
}

/// Apply pool events: idle reports and worker exits.
async fn track_workers<S>(pool: Arc<WorkerPool<S>>, mut events: mpsc::UnboundedReceiver<PoolEvent>)
where
    S: Spawner<Handle = WorkerHandle>,
{
    while let Some(event) = events.recv().await {
        match event {
            PoolEvent::Idle(id) => {
                pool.release(id);
                if pool.is_closed() {
                    if let Some(handle) = pool.handle(id) {
                        if let Err(e) = handle.shutdown().await {
                            tracing::debug!("Worker {} did not take shutdown: {}", id, e);
                        }
                    }
                }
            }
            PoolEvent::Dead(id) => {
                pool.mark_dead(id);
            }
        }
    }
}

async fn shutdown_signal() -> io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        r = tokio::signal::ctrl_c() => r,
        _ = term.recv() => Ok(()),
    }
}

/// Create the session scratch directory and give it to the worker account.
pub fn prepare_scratch(config: &DaemonConfig) -> Result<PathBuf> {
    let dir = config.scratch_path();
    fs::create_dir_all(&dir).with_context(|| format!("Cannot create scratch directory {}", dir.display()))?;
    fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))
        .with_context(|| format!("Cannot restrict {}", dir.display()))?;
    let (user, gid) = worker::resolve_account(config)?;
    let uid = user.map(|u| u.uid);
    if uid.is_some() || gid.is_some() {
        chown(&dir, uid, gid).with_context(|| format!("Cannot hand {} to the worker account", dir.display()))?;
    }
    tracing::debug!("Session scratch space in {}", dir.display());
    Ok(dir)
}

/// Main daemon entry point. `verbosity` is passed on to the workers.
pub async fn run_daemon(config: DaemonConfig, verbosity: u8) -> Result<()> {
    config.validate()?;
    let tree = RepoTree::load(
        &config.repository,
        LoadOptions {
            check_permissions: config.check_permissions,
        },
    )
    .with_context(|| format!("Cannot open repository {}", config.repository.display()))?;
    tracing::info!("Serving {} ({} nodes)", config.repository.display(), tree.len());
    prepare_scratch(&config)?;

    let locks = LocalLocks::new(LockManager::new(tree), config.lock_timeout());
    let (events_tx, events_rx) = mpsc::unbounded_channel();
    let spawner = ProcessSpawner::new(&config, verbosity, locks, events_tx)?;
    let pool = Arc::new(WorkerPool::new(spawner, config.max_workers));
    tokio::spawn(track_workers(pool.clone(), events_rx));

    let listener = TcpListener::bind(&config.listen)
        .await
        .with_context(|| format!("Failed to listen on {}", config.listen))?;
    tracing::info!("Listening on {} with up to {} workers", config.listen, pool.max());

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);
    let mut seq: u64 = 0;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        continue;
                    }
                };
                seq += 1;
                tracing::debug!("Connection {} from {}", seq, peer);
                let pool = pool.clone();
                let session = seq;
                tokio::spawn(async move {
                    if let Err(e) = hand_off(&pool, session, stream).await {
                        tracing::error!("Session {} from {} dropped: {:#}", session, peer, e);
                    }
                });
            }
            signalled = &mut shutdown => {
                signalled.context("Failed to install signal handlers")?;
                break;
            }
        }
    }

    drop(listener);
    let idle = pool.close();
    tracing::info!("Shutting down: {} idle workers, waiting for busy ones", idle.len());
    for (id, handle) in idle {
        if let Err(e) = handle.shutdown().await {
            tracing::debug!("Worker {} did not take shutdown: {}", id, e);
        }
    }
    pool.wait_empty().await;
    tracing::info!("All workers gone");
    Ok(())
}

//! Worker process: `rcvs worker --id N`, started by the daemon.
//!
//! The control socket is inherited on fd 3 and the effective daemon
//! configuration arrives in `RCVS_WORKER_CONFIG`. The worker confines itself
//! (chroot, then group, then user) before it reads a byte from any client,
//! then serves one session at a time on a single-threaded runtime.

use super::control::{Channel, ControlSocket, Message};
use crate::config::DaemonConfig;
use crate::error::{CvsError, LockError, Result as CvsResult};
use crate::protocol::Connection;
use crate::repo::{LockKind, OwnerId};
use crate::server::{serve_session, DefaultExecutor, HeadStore, LockService, ServerEnv};
use anyhow::{Context, Result};
use async_trait::async_trait;
use nix::unistd::{chdir, chroot, setgid, setuid, Gid, Group, User};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tracing::Instrument;

pub const CONTROL_FD: RawFd = 3;
pub const WORKER_CONFIG_ENV: &str = "RCVS_WORKER_CONFIG";

/// Lock service that asks the parent over the control channel.
pub struct RemoteLocks {
    channel: Arc<Channel>,
}

impl RemoteLocks {
    pub fn new(channel: Arc<Channel>) -> Self {
        Self { channel }
    }

    fn unavailable(why: impl std::fmt::Display) -> CvsError {
        LockError::Unavailable(format!("control channel: {}", why)).into()
    }

    async fn call(&self, msg: Message) -> CvsResult<()> {
        self.channel.send(&msg).await.map_err(Self::unavailable)?;
        match self.channel.recv().await.map_err(Self::unavailable)? {
            Some((Message::Granted, _)) => Ok(()),
            Some((Message::Refused(e), _)) => Err(e.into()),
            Some((other, _)) => Err(Self::unavailable(format!("unexpected reply {:?}", other))),
            None => Err(Self::unavailable("parent went away")),
        }
    }

    /// Tell the parent this worker can take another session.
    pub async fn idle(&self) -> std::io::Result<()> {
        self.channel.send(&Message::Idle).await
    }
}

#[async_trait]
impl LockService for RemoteLocks {
    async fn lock(&mut self, owner: OwnerId, path: &str, kind: LockKind) -> CvsResult<()> {
        self.call(Message::Lock {
            owner,
            path: path.to_string(),
            kind,
        })
        .await
    }

    async fn unlock(&mut self, owner: OwnerId, path: &str) -> CvsResult<()> {
        self.call(Message::Unlock {
            owner,
            path: path.to_string(),
        })
        .await
    }

    async fn release_all(&mut self, owner: OwnerId) -> CvsResult<()> {
        self.call(Message::ReleaseAll { owner }).await
    }
}

fn denied(what: &str, e: impl std::fmt::Display) -> CvsError {
    CvsError::Permission(format!("{}: {}", what, e))
}

/// The configured worker account: the user, if any, and the group to use.
pub(crate) fn resolve_account(config: &DaemonConfig) -> CvsResult<(Option<User>, Option<Gid>)> {
    let user = match &config.user {
        Some(name) => Some(
            User::from_name(name)
                .map_err(|e| denied(&format!("look up user {}", name), e))?
                .ok_or_else(|| CvsError::Permission(format!("no such user {}", name)))?,
        ),
        None => None,
    };
    let gid = match &config.group {
        Some(name) => Some(
            Group::from_name(name)
                .map_err(|e| denied(&format!("look up group {}", name), e))?
                .ok_or_else(|| CvsError::Permission(format!("no such group {}", name)))?
                .gid,
        ),
        None => user.as_ref().map(|u| u.gid),
    };
    Ok((user, gid))
}

/// chroot to the repository and switch to the configured account.
fn confine(config: &DaemonConfig) -> CvsResult<()> {
    // Account lookups need /etc, so resolve them before chroot.
    let (user, gid) = resolve_account(config)?;

    if config.chroot {
        chroot(&config.repository).map_err(|e| denied(&format!("chroot {}", config.repository.display()), e))?;
        chdir("/").map_err(|e| denied("chdir /", e))?;
    }

    if let Some(gid) = gid {
        #[cfg(target_os = "linux")]
        nix::unistd::setgroups(&[gid]).map_err(|e| denied("setgroups", e))?;
        setgid(gid).map_err(|e| denied("setgid", e))?;
    }
    match &user {
        Some(u) => setuid(u.uid).map_err(|e| denied("setuid", e))?,
        None if nix::unistd::geteuid().is_root() => {
            tracing::warn!("Worker still running as root; set `user` in the daemon configuration");
        }
        None => {}
    }
    Ok(())
}

/// Entry point of the hidden `worker` subcommand.
pub fn run_worker(id: u32) -> Result<()> {
    let text = std::env::var(WORKER_CONFIG_ENV).context("Worker started without a configuration")?;
    let config = DaemonConfig::parse(&text)?;

    // SAFETY: the daemon installs the control socket on this descriptor
    // right before exec; nothing else in this process owns it.
    let socket = ControlSocket::from_fd(unsafe { OwnedFd::from_raw_fd(CONTROL_FD) });

    confine(&config).context("Failed to drop privileges")?;
    tracing::debug!("Worker {} confined (chroot: {})", id, config.chroot);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("Failed to start worker runtime")?;
    runtime.block_on(serve(id, socket, config).instrument(tracing::info_span!("worker", worker = id)))
}

async fn serve(id: u32, socket: ControlSocket, config: DaemonConfig) -> Result<()> {
    let channel = Arc::new(Channel::new(socket)?);
    let store_base = if config.chroot {
        PathBuf::from("/")
    } else {
        config.repository.clone()
    };
    let env = ServerEnv::new(
        Arc::new(HeadStore::new(&store_base)),
        Arc::new(DefaultExecutor::default()),
    )
    .with_root(config.repository.to_string_lossy())
    .with_scratch(config.worker_scratch_path());
    let mut locks = RemoteLocks::new(channel.clone());

    loop {
        let Some((msg, fd)) = channel.recv().await? else {
            tracing::debug!("Daemon closed the control channel");
            return Ok(());
        };
        match (msg, fd) {
            (Message::Shutdown, _) => {
                tracing::info!("Shutting down");
                return Ok(());
            }
            (Message::Session { seq }, Some(fd)) => {
                let std_stream = std::net::TcpStream::from(fd);
                std_stream.set_nonblocking(true)?;
                let stream = TcpStream::from_std(std_stream)?;
                let peer = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
                tracing::info!("Session {} from {}", seq, peer);

                let (r, w) = stream.into_split();
                let mut conn = Connection::new(r, w);
                let owner = OwnerId::new(id, seq);
                if let Err(e) = serve_session(&mut conn, &env, &mut locks, owner).await {
                    tracing::warn!("Session {} ended with error: {:#}", seq, e);
                }
                drop(conn);
                tracing::debug!("Session {} closed", seq);
                locks.idle().await?;
            }
            (Message::Session { seq }, None) => {
                tracing::warn!("Session {} arrived without a client socket", seq);
                locks.idle().await?;
            }
            (other, _) => tracing::warn!("Unexpected control message {:?}", other),
        }
    }
}

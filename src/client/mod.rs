//! Client side: scan the working copy, send it, apply the responses.

pub mod requests;
pub mod responses;
pub mod transport;

pub use requests::Contents;
pub use responses::{Completion, FileFailure, PatchFormat, Patcher, ReplacePatcher, ResponseDispatcher, Transcript};
pub use transport::Link;

use crate::error::CvsError;
use crate::protocol::Connection;
use crate::root::CvsRoot;
use crate::worktree::{scan, IgnoreSet, ScanFlags, ScanOptions};
use anyhow::{bail, Context, Result};
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

/// Settings shared by every command.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// `-d`: overrides `CVS/Root` and `$CVSROOT`.
    pub root: Option<String>,
    /// `Global_option` flags, e.g. `-q`, `-n`.
    pub global: Vec<String>,
    /// Collect output instead of printing it.
    pub capture: bool,
}

/// One command to run against the server.
#[derive(Debug, Clone)]
pub struct CommandRequest {
    pub name: String,
    /// Flags and file names, sent as `Argument`s.
    pub args: Vec<String>,
    pub recurse: bool,
    pub contents: Contents,
}

impl CommandRequest {
    pub fn new(name: &str, args: Vec<String>) -> Self {
        Self {
            name: name.to_string(),
            args,
            recurse: true,
            contents: Contents::Send,
        }
    }

    /// Commands that start without a working copy.
    fn creates_working_copy(&self) -> bool {
        matches!(self.name.as_str(), "checkout" | "co")
    }
}

#[derive(Debug, Clone)]
pub struct Outcome {
    pub completion: Completion,
    pub failures: Vec<FileFailure>,
    pub transcript: Option<Transcript>,
}

impl Outcome {
    pub fn success(&self) -> bool {
        self.completion == Completion::Ok && self.failures.is_empty()
    }
}

/// Connect to the server for `dir` and run one command.
pub async fn run_command(dir: &Path, opts: &ClientOptions, req: &CommandRequest) -> Result<Outcome> {
    let root = CvsRoot::resolve(opts.root.as_deref(), dir)?;
    tracing::debug!("Using root {}", root);
    let mut link = Link::open(&root).await?;
    let outcome = converse(&mut link.conn, dir, &root, opts, req).await;
    link.close().await?;
    outcome
}

/// Run one command over an established connection.
pub async fn converse<R, W>(
    conn: &mut Connection<R, W>,
    dir: &Path,
    root: &CvsRoot,
    opts: &ClientOptions,
    req: &CommandRequest,
) -> Result<Outcome>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let tree = if req.creates_working_copy() {
        None
    } else {
        if !requests::is_working_dir(dir) {
            bail!("{} is not a working directory (no CVS/ admin files)", dir.display());
        }
        let mut flags = ScanFlags::default();
        if !req.recurse {
            flags.remove(ScanFlags::RECURSE);
        }
        let ignore = IgnoreSet::for_user();
        Some(scan(dir, &ScanOptions::new(flags).with_ignore(ignore)).context("Failed to scan working copy")?)
    };

    let mut dispatcher = ResponseDispatcher::new(dir, &root.to_string(), &root.path);
    if let Some(t) = &tree {
        dispatcher = dispatcher.with_tree(t.clone());
    }
    if opts.capture {
        dispatcher = dispatcher.capture_output();
    }

    requests::send_preamble(conn, &root.path).await?;
    if let Completion::Error(msg) = dispatcher.run(conn).await? {
        bail!("Server refused the connection: {}", msg);
    }
    if let Some(valid) = dispatcher.valid_requests() {
        if !valid.contains(req.name.as_str()) {
            bail!("Server does not support `{}'", req.name);
        }
    }

    let global: Vec<&str> = opts.global.iter().map(String::as_str).collect();
    requests::send_global_options(conn, &global).await?;
    match &tree {
        Some(t) => requests::send_working_tree(conn, t, &root.path, req.contents).await?,
        None => requests::send_top_directory(conn, &root.path).await?,
    }
    requests::send_arguments(conn, &req.args).await?;
    requests::send_command(conn, &req.name).await?;

    let completion = dispatcher.run(conn).await;
    let closed = dispatcher.close();
    let completion = completion?;
    closed.map_err(|e: CvsError| anyhow::Error::from(e).context("Failed to save entries"))?;

    Ok(Outcome {
        completion,
        failures: dispatcher.failures().to_vec(),
        transcript: dispatcher.transcript().cloned(),
    })
}

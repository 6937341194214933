//! Request dispatcher: the server side of one connection.
//!
//! ```text
//! AwaitingRoot --Root--> Configuring --(Directory|Entry|Modified|Argument...)--> Configuring
//!      ^                      |
//!      +---- ok / error <-----+-- command (update, commit, ...)
//! ```
//!
//! Preamble requests (`Valid-responses`, `valid-requests`, `Global_option`,
//! ...) are accepted in any state. An unknown request gets an `error` line
//! and the connection stays up; a request out of order for the state ends
//! the connection.

use super::commands::{CommandContext, CommandExecutor, Response};
use super::locks::LockService;
use super::session::Session;
use super::store::RevisionStore;
use crate::error::{CvsError, ProtocolError, Result};
use crate::protocol::{
    checksum_hex, is_writing_command, lookup_request, split_line, valid_requests, Connection,
    RequestClass,
};
use crate::repo::{LockKind, OwnerId};
use crate::timestamp;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

/// What a server needs besides the connection.
#[derive(Clone)]
pub struct ServerEnv {
    /// The only `Root` clients may name; any root when `None`.
    pub root: Option<String>,
    pub store: Arc<dyn RevisionStore>,
    pub executor: Arc<dyn CommandExecutor>,
    /// Author recorded on commits.
    pub user: String,
    /// Directory for per-session scratch space; the system temp dir when
    /// `None`. A chrooted worker has no `/tmp`, so the daemon sets this.
    pub scratch: Option<PathBuf>,
}

impl ServerEnv {
    pub fn new(store: Arc<dyn RevisionStore>, executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            root: None,
            store,
            executor,
            user: std::env::var("USER").unwrap_or_else(|_| "anonymous".to_string()),
            scratch: None,
        }
    }

    pub fn with_scratch(mut self, dir: impl Into<PathBuf>) -> Self {
        self.scratch = Some(dir.into());
        self
    }

    pub fn with_root(mut self, root: impl Into<String>) -> Self {
        self.root = Some(root.into().trim_end_matches('/').to_string());
        self
    }
}

/// Map the absolute remote path of a `Directory` request into the repository.
fn repo_relative(root: &str, remote: &str) -> Result<String> {
    let remote = remote.trim_end_matches('/');
    if remote == root {
        return Ok(".".to_string());
    }
    match remote.strip_prefix(root).and_then(|r| r.strip_prefix('/')) {
        Some(rel) if !rel.split('/').any(|s| s == ".." || s.is_empty()) => Ok(rel.to_string()),
        _ => Err(ProtocolError::Malformed {
            what: "repository path",
            line: remote.to_string(),
        }
        .into()),
    }
}

fn wire_dir(dir: &str) -> String {
    if dir == "." {
        "./".to_string()
    } else {
        format!("{}/", dir)
    }
}

async fn write_response<R, W>(conn: &mut Connection<R, W>, session: &Session, resp: &Response) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match resp {
        Response::Ok => conn.write_line("ok").await,
        Response::Error(msg) if msg.is_empty() => conn.write_line("error").await,
        Response::Error(msg) => conn.write_line(&format!("error {}", msg)).await,
        Response::M(text) => conn.write_line(&format!("M {}", text)).await,
        Response::E(text) => conn.write_line(&format!("E {}", text)).await,
        Response::MT(text) => conn.write_line(&format!("MT {}", text)).await,
        Response::ValidRequests(list) => conn.write_line(&format!("Valid-requests {}", list)).await,
        Response::CheckedIn { dir, repo_path, entry } | Response::NewEntry { dir, repo_path, entry } => {
            let keyword = if matches!(resp, Response::CheckedIn { .. }) {
                "Checked-in"
            } else {
                "New-entry"
            };
            conn.write_line(&format!("{} {}", keyword, wire_dir(dir))).await?;
            conn.write_line(repo_path).await?;
            conn.write_line(&entry.to_string()).await
        }
        Response::RemoveEntry { dir, repo_path } => {
            conn.write_line(&format!("Remove-entry {}", wire_dir(dir))).await?;
            conn.write_line(repo_path).await
        }
        Response::Removed { dir, repo_path } => {
            conn.write_line(&format!("Removed {}", wire_dir(dir))).await?;
            conn.write_line(repo_path).await
        }
        Response::SetSticky { dir, repo_path, tag } => {
            if !session.accepts("Set-sticky") {
                return Ok(());
            }
            conn.write_line(&format!("Set-sticky {}", wire_dir(dir))).await?;
            conn.write_line(repo_path).await?;
            conn.write_line(tag).await
        }
        Response::ClearSticky { dir, repo_path } => {
            if !session.accepts("Clear-sticky") {
                return Ok(());
            }
            conn.write_line(&format!("Clear-sticky {}", wire_dir(dir))).await?;
            conn.write_line(repo_path).await
        }
        Response::File {
            kind,
            dir,
            repo_path,
            entry,
            mode,
            mod_time,
            data,
        } => {
            if let Some(t) = mod_time.filter(|_| session.accepts("Mod-time")) {
                conn.write_line(&format!("Mod-time {}", timestamp::format_mod_time(t)))
                    .await?;
            }
            if session.accepts("Checksum") {
                conn.write_line(&format!("Checksum {}", checksum_hex(data))).await?;
            }
            let keyword = if session.accepts(kind.keyword()) {
                kind.keyword()
            } else {
                "Updated"
            };
            conn.write_line(&format!("{} {}", keyword, wire_dir(dir))).await?;
            conn.write_line(repo_path).await?;
            conn.write_line(&entry.to_string()).await?;
            conn.send_file(*mode, data).await
        }
    }
}

struct Dispatcher<'a, R, W, L> {
    conn: &'a mut Connection<R, W>,
    env: &'a ServerEnv,
    locks: &'a mut L,
    owner: OwnerId,
    session: Session,
}

impl<R, W, L> Dispatcher<'_, R, W, L>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    L: LockService,
{
    async fn run(&mut self) -> Result<()> {
        while let Some(line) = self.conn.read_line().await? {
            self.handle(&line).await?;
        }
        tracing::debug!("Client {} closed the connection", self.owner);
        Ok(())
    }

    async fn handle(&mut self, line: &str) -> Result<()> {
        let (name, arg) = split_line(line);
        let Some(spec) = lookup_request(name) else {
            tracing::warn!("Unrecognized request from {}: {}", self.owner, name);
            self.conn
                .write_line(&format!("error unrecognized request `{}'", name))
                .await?;
            return self.conn.flush().await;
        };

        match spec.class {
            RequestClass::Preamble => self.preamble(name, arg).await,
            RequestClass::Root => self.set_root(arg),
            _ if self.session.root().is_none() => Err(ProtocolError::OutOfOrder {
                request: name.to_string(),
                expected: "Root",
            }
            .into()),
            RequestClass::Configuring => self.configure(name, arg).await,
            RequestClass::Command => self.command(name).await,
        }
    }

    fn set_root(&mut self, arg: &str) -> Result<()> {
        if let Some(allowed) = &self.env.root {
            if arg.trim_end_matches('/') != allowed {
                return Err(ProtocolError::Malformed {
                    what: "root (not served here)",
                    line: arg.to_string(),
                }
                .into());
            }
        }
        self.session.set_root(arg)?;
        tracing::debug!("{} using root {}", self.owner, arg);
        Ok(())
    }

    async fn preamble(&mut self, name: &str, arg: &str) -> Result<()> {
        match name {
            "Valid-responses" => {
                self.session.valid_responses = Some(arg.split_whitespace().map(str::to_string).collect());
                Ok(())
            }
            "valid-requests" => {
                self.conn
                    .write_line(&format!("Valid-requests {}", valid_requests()))
                    .await?;
                self.conn.write_line("ok").await?;
                self.conn.flush().await
            }
            "Global_option" => {
                if !self.session.global.apply(arg) {
                    self.session.defer_error(format!("unknown global option `{}'", arg));
                }
                Ok(())
            }
            "Noop" => {
                self.conn.write_line("ok").await?;
                self.conn.flush().await
            }
            "version" => {
                self.conn
                    .write_line(&format!("M rcvs {}", env!("CARGO_PKG_VERSION")))
                    .await?;
                self.conn.write_line("ok").await?;
                self.conn.flush().await
            }
            // UseUnchanged, Set
            _ => Ok(()),
        }
    }

    async fn configure(&mut self, name: &str, arg: &str) -> Result<()> {
        match name {
            "Directory" => {
                let remote = self.conn.expect_line().await?;
                let root = self.session.root().unwrap_or_default().to_string();
                let repo = repo_relative(&root, &remote)?;
                self.session.enter_directory(arg, &repo)?;
                Ok(())
            }
            "Max-dotdot" => {
                self.session.max_dotdot = arg.trim().parse().map_err(|_| ProtocolError::Malformed {
                    what: "Max-dotdot",
                    line: arg.to_string(),
                })?;
                Ok(())
            }
            "Static-directory" => self.session.set_static(),
            "Sticky" => self.session.set_sticky(arg),
            "Entry" => self.session.add_entry(arg),
            "Kopt" => {
                self.session.set_kopt(arg);
                Ok(())
            }
            "Checkin-time" => {
                match timestamp::parse_mod_time(arg).or_else(|| timestamp::parse_entry_time(arg)) {
                    Some(secs) => self.session.set_checkin_time(secs),
                    None => self.session.defer_error(format!("cannot parse date `{}'", arg)),
                }
                Ok(())
            }
            "Modified" => {
                let (mode, data) = self.conn.recv_file().await?;
                self.session.claim_modified(arg, mode, data)
            }
            "Is-modified" => self.session.claim_is_modified(arg),
            "Unchanged" => self.session.claim_unchanged(arg),
            "Questionable" => self.session.claim_questionable(arg),
            "Argument" => {
                self.session.push_argument(arg);
                Ok(())
            }
            "Argumentx" => self.session.extend_argument(arg),
            _ => Ok(()),
        }
    }

    /// Take a lock; a recoverable failure is reported with the next command.
    async fn lock(&mut self, repo: &str, kind: LockKind) -> Result<()> {
        match self.locks.lock(self.owner, repo, kind).await {
            Ok(()) => Ok(()),
            Err(e) if !e.is_fatal() => {
                tracing::warn!("{} could not lock {}: {}", self.owner, repo, e);
                self.session.defer_error(format!("{}: {}", repo, e));
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Lock every directory the session touched, in path order.
    ///
    /// Nothing is held while requests are still arriving, so a session only
    /// ever waits while holding locks that sort before the one it waits for.
    async fn lock_touched(&mut self, kind: LockKind) -> Result<()> {
        self.locks.release_all(self.owner).await?;
        for repo in self.session.repo_dirs() {
            self.lock(&repo, kind).await?;
        }
        Ok(())
    }

    async fn command(&mut self, name: &str) -> Result<()> {
        self.session.flush_entries()?;
        let kind = if is_writing_command(name) {
            LockKind::Write
        } else {
            LockKind::Read
        };
        self.lock_touched(kind).await?;

        let deferred = self.session.take_deferred();
        let responses = if deferred.is_empty() {
            let root = self.session.root().unwrap_or_default().to_string();
            let ctx = CommandContext {
                name,
                session: &self.session,
                root: &root,
                user: &self.env.user,
                store: self.env.store.as_ref(),
            };
            self.env.executor.execute(&ctx)
        } else {
            let mut out: Vec<Response> = deferred
                .into_iter()
                .map(|msg| Response::E(format!("rcvs {}: {}", name, msg)))
                .collect();
            out.push(Response::Error(String::new()));
            out
        };

        tracing::info!("{} ran {} ({} responses)", self.owner, name, responses.len());
        for resp in &responses {
            write_response(self.conn, &self.session, resp).await?;
        }
        if !responses.last().is_some_and(Response::is_terminal) {
            self.conn.write_line("ok").await?;
        }
        self.conn.flush().await?;

        self.locks.release_all(self.owner).await?;
        self.session.reset()
    }
}

/// Serve one client connection until it closes.
///
/// Every lock the session took is released on the way out, whatever the
/// outcome. A fatal error is reported to the client (if the stream still
/// works) and returned.
pub async fn serve_session<R, W, L>(
    conn: &mut Connection<R, W>,
    env: &ServerEnv,
    locks: &mut L,
    owner: OwnerId,
) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    L: LockService,
{
    tracing::info!("Session {} started", owner);
    let session = Session::new_in(env.scratch.as_deref())?;
    let mut dispatcher = Dispatcher {
        conn,
        env,
        locks,
        owner,
        session,
    };
    let result = dispatcher.run().await;

    if let Err(ref e) = result {
        tracing::warn!("Session {} failed: {}", owner, e);
        if !matches!(e, CvsError::Protocol(ProtocolError::Truncated) | CvsError::Io(_)) {
            let reported = match dispatcher.conn.write_line(&format!("error {}", e)).await {
                Ok(()) => dispatcher.conn.flush().await,
                Err(e) => Err(e),
            };
            if let Err(e) = reported {
                tracing::debug!("Could not report failure to {}: {}", owner, e);
            }
        }
    }
    if let Err(e) = dispatcher.locks.release_all(owner).await {
        tracing::warn!("Releasing locks of {} failed: {}", owner, e);
    }
    tracing::info!("Session {} ended", owner);
    result.map_err(anyhow::Error::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::{LoadOptions, LockManager, RepoTree};
    use crate::server::commands::DefaultExecutor;
    use crate::server::locks::LocalLocks;
    use crate::server::store::MemoryStore;
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_repo_relative() {
        assert_eq!(repo_relative("/repo", "/repo").unwrap(), ".");
        assert_eq!(repo_relative("/repo", "/repo/mod/sub/").unwrap(), "mod/sub");
        assert_eq!(repo_relative("", "/mod").unwrap(), "mod");
        assert!(repo_relative("/repo", "/other/mod").is_err());
        assert!(repo_relative("/repo", "/repository").is_err());
        assert!(repo_relative("/repo", "/repo/../etc").is_err());
    }

    async fn converse(input: &str) -> (String, anyhow::Result<()>) {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("mod")).unwrap();
        let tree = RepoTree::load(tmp.path(), LoadOptions::default()).unwrap();
        let mut locks = LocalLocks::new(LockManager::new(tree), None);
        let env = ServerEnv::new(Arc::new(MemoryStore::new()), Arc::new(DefaultExecutor::default()));

        let (mut out_r, out_w) = tokio::io::duplex(64 * 1024);
        let mut conn = Connection::new(input.as_bytes(), out_w);
        let result = serve_session(&mut conn, &env, &mut locks, OwnerId::new(1, 1)).await;
        drop(conn);
        let mut text = String::new();
        out_r.read_to_string(&mut text).await.unwrap();
        (text, result)
    }

    #[tokio::test]
    async fn test_valid_requests_and_version() {
        let (out, result) = converse("valid-requests\nversion\n").await;
        result.unwrap();
        let mut lines = out.lines();
        assert!(lines.next().unwrap().starts_with("Valid-requests Root "));
        assert_eq!(lines.next(), Some("ok"));
        assert!(lines.next().unwrap().starts_with("M rcvs "));
        assert_eq!(lines.next(), Some("ok"));
    }

    #[tokio::test]
    async fn test_unknown_global_option_fails_next_command() {
        let (out, result) = converse("Root /repo\nGlobal_option -z\nupdate\n").await;
        result.unwrap();
        assert_eq!(
            out,
            "E rcvs update: unknown global option `-z'\nerror\n"
        );
    }

    #[tokio::test]
    async fn test_bad_directory_path_is_fatal() {
        let (out, result) = converse("Root /repo\nDirectory .\n/elsewhere/mod\nupdate\n").await;
        assert!(result.is_err());
        assert!(out.starts_with("error "));
    }
}

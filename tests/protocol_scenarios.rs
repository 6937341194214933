//! End-to-end protocol conversations: scripted clients against the request
//! dispatcher, scripted servers against the response dispatcher, and the
//! real client talking to the real server over in-memory pipes.

use rcvs::client::{self, ClientOptions, CommandRequest, Completion, ResponseDispatcher};
use rcvs::config::DaemonConfig;
use rcvs::daemon::prepare_scratch;
use rcvs::entries::{Entries, OpenMode};
use rcvs::protocol::{checksum_hex, Connection};
use rcvs::repo::{LockKind, LockManager, OwnerId, RepoTree};
use rcvs::root::CvsRoot;
use rcvs::server::{serve_session, DefaultExecutor, LocalLocks, LockService, MemoryStore, RevisionStore, ServerEnv};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::task::JoinHandle;

struct Fixture {
    _repo: TempDir,
    store: Arc<MemoryStore>,
    locks: LocalLocks,
    env: ServerEnv,
}

impl Fixture {
    fn new() -> Self {
        let repo = TempDir::new().unwrap();
        let store = Arc::new(MemoryStore::new());
        store.insert("mod/foo", "1.1", "hello\n");
        store.insert("mod/sub/bar", "1.1", "bar\n");

        let locks = LocalLocks::new(LockManager::new(RepoTree::empty(repo.path())), None);
        let env = ServerEnv::new(store.clone(), Arc::new(DefaultExecutor::default())).with_root("/repo");
        Self {
            _repo: repo,
            store,
            locks,
            env,
        }
    }

    /// Feed `input` to a fresh session; returns what the server wrote.
    async fn serve(&self, session: u64, input: &str) -> (String, anyhow::Result<()>) {
        self.serve_with(&self.env, session, input).await
    }

    async fn serve_with(&self, env: &ServerEnv, session: u64, input: &str) -> (String, anyhow::Result<()>) {
        let (mut out_r, out_w) = tokio::io::duplex(256 * 1024);
        let mut conn = Connection::new(input.as_bytes(), out_w);
        let mut locks = self.locks.clone();
        let result = serve_session(&mut conn, env, &mut locks, OwnerId::new(1, session)).await;
        drop(conn);
        let mut text = String::new();
        out_r.read_to_string(&mut text).await.unwrap();
        (text, result)
    }

    /// Start a session whose requests the test writes as it goes. Dropping
    /// the returned pipe ends the client side.
    fn open(&self, env: ServerEnv, session: u64) -> (DuplexStream, JoinHandle<(String, anyhow::Result<()>)>) {
        let (client, server_in) = tokio::io::duplex(64 * 1024);
        let mut locks = self.locks.clone();
        let task = tokio::spawn(async move {
            let (mut out_r, out_w) = tokio::io::duplex(256 * 1024);
            let mut conn = Connection::new(server_in, out_w);
            let result = serve_session(&mut conn, &env, &mut locks, OwnerId::new(1, session)).await;
            drop(conn);
            let mut text = String::new();
            out_r.read_to_string(&mut text).await.unwrap();
            (text, result)
        });
        (client, task)
    }
}

async fn finish(task: JoinHandle<(String, anyhow::Result<()>)>) -> String {
    let (out, result) = tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .expect("session did not finish")
        .unwrap();
    result.unwrap();
    out
}

const PREFIX: &str = "Root /repo\nDirectory .\n/repo/mod\n";

#[tokio::test]
async fn scenario_a_current_file_needs_no_transfer() {
    let fx = Fixture::new();
    let input = format!("{}Entry /foo/1.1///\nUnchanged foo\nupdate\n", PREFIX);
    let (out, result) = fx.serve(1, &input).await;
    result.unwrap();
    assert_eq!(out, "ok\n");
}

#[tokio::test]
async fn scenario_d_empty_modified_payload() {
    let fx = Fixture::new();
    let input = format!(
        "{}Entry /foo/1.1///\nModified foo\nu=rw,g=r,o=r\n0\nArgument -m\nArgument empty it\ncommit\n",
        PREFIX
    );
    let (out, result) = fx.serve(1, &input).await;
    result.unwrap();

    assert!(out.contains("Checked-in ./\n/repo/mod/foo\n/foo/1.2/"), "{}", out);
    assert!(out.ends_with("ok\n"));
    assert_eq!(fx.store.head("mod/foo").unwrap().unwrap().number, "1.2");
    assert!(fx.store.checkout("mod/foo", "1.2").unwrap().is_empty());
}

#[tokio::test]
async fn scenario_e_dropped_connection_releases_locks() {
    let fx = Fixture::new();
    // The second Directory never gets its remote path.
    let (_, result) = fx.serve(1, &format!("{}Directory sub\n", PREFIX)).await;
    assert!(result.is_err());

    let mut other = fx.locks.clone();
    tokio::time::timeout(
        Duration::from_secs(5),
        other.lock(OwnerId::new(2, 1), "mod", LockKind::Write),
    )
    .await
    .expect("write lock still blocked")
    .unwrap();
}

#[tokio::test]
async fn reader_waiting_on_command_does_not_block_committer() {
    let fx = Fixture::new();

    // Session 1 names mod/sub and then goes quiet before its command.
    let (mut reader, reader_task) = fx.open(fx.env.clone(), 1);
    reader
        .write_all(b"Root /repo\nDirectory sub\n/repo/mod/sub\n")
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Session 2 commits across mod and mod/sub meanwhile.
    let (mut committer, committer_task) = fx.open(fx.env.clone(), 2);
    let commit = format!(
        "{}Entry /foo/1.1///\nModified foo\nu=rw,g=r,o=r\n4\nnew\nDirectory sub\n/repo/mod/sub\nEntry /bar/1.1///\nUnchanged bar\nArgument -m\nArgument both\ncommit\n",
        PREFIX
    );
    committer.write_all(commit.as_bytes()).await.unwrap();
    drop(committer);
    tokio::time::sleep(Duration::from_millis(50)).await;

    // Session 1 now reaches into mod, which the commit locks for writing.
    reader
        .write_all(b"Directory .\n/repo/mod\nupdate\n")
        .await
        .unwrap();
    drop(reader);

    let out = finish(committer_task).await;
    assert!(out.ends_with("ok\n"), "{}", out);
    let out = finish(reader_task).await;
    assert!(out.ends_with("ok\n"), "{}", out);
    assert_eq!(fx.store.head("mod/foo").unwrap().unwrap().number, "1.2");
    assert!(fx.locks.with_manager(|m| m.held_by(OwnerId::new(1, 2)).is_empty()).unwrap());
}

#[tokio::test]
async fn session_scratch_lives_in_configured_dir() {
    let fx = Fixture::new();
    let scratch = TempDir::new().unwrap();
    let (mut input, task) = fx.open(fx.env.clone().with_scratch(scratch.path()), 1);
    input.write_all(PREFIX.as_bytes()).await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 1);

    input.write_all(b"Entry /foo/1.1///\nUnchanged foo\nupdate\n").await.unwrap();
    drop(input);
    assert_eq!(finish(task).await, "ok\n");
    assert_eq!(fs::read_dir(scratch.path()).unwrap().count(), 0);
}

#[tokio::test]
async fn missing_scratch_dir_fails_session() {
    let fx = Fixture::new();
    let env = fx.env.clone().with_scratch("/nonexistent-rcvs-scratch");
    let (_, result) = fx.serve_with(&env, 1, "Root /repo\nvalid-requests\n").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn daemon_prepares_scratch_inside_repository() {
    let fx = Fixture::new();
    let repo = TempDir::new().unwrap();
    let config = DaemonConfig {
        repository: repo.path().to_path_buf(),
        chroot: false,
        ..DaemonConfig::default()
    };
    let dir = prepare_scratch(&config).unwrap();
    assert_eq!(dir, repo.path().join("CVSROOT/tmp"));
    assert_eq!(fs::metadata(&dir).unwrap().permissions().mode() & 0o777, 0o700);

    let env = fx.env.clone().with_scratch(config.worker_scratch_path());
    let input = format!("{}Entry /foo/1.1///\nUnchanged foo\nupdate\n", PREFIX);
    let (out, result) = fx.serve_with(&env, 1, &input).await;
    result.unwrap();
    assert_eq!(out, "ok\n");
}

#[tokio::test]
async fn unchanged_twice_is_same_as_once() {
    let fx = Fixture::new();
    let once = format!("{}Entry /foo/1.1///\nUnchanged foo\nstatus\n", PREFIX);
    let twice = format!("{}Entry /foo/1.1///\nUnchanged foo\nUnchanged foo\nstatus\n", PREFIX);
    let (a, ra) = fx.serve(1, &once).await;
    let (b, rb) = fx.serve(2, &twice).await;
    ra.unwrap();
    rb.unwrap();
    assert_eq!(a, b);
}

#[tokio::test]
async fn duplicate_root_is_fatal() {
    let fx = Fixture::new();
    let (out, result) = fx.serve(1, "Root /repo\nRoot /repo\nupdate\n").await;
    assert!(result.is_err());
    assert!(out.starts_with("error "));
    assert!(!out.contains("ok\n"));
}

#[tokio::test]
async fn foreign_root_is_fatal() {
    let fx = Fixture::new();
    let (out, result) = fx.serve(1, "Root /etc\n").await;
    assert!(result.is_err());
    assert!(out.starts_with("error "));
}

#[tokio::test]
async fn request_before_root_is_fatal() {
    let fx = Fixture::new();
    let (_, result) = fx.serve(1, "Directory .\n/repo/mod\nupdate\n").await;
    assert!(result.is_err());
}

#[tokio::test]
async fn unknown_request_keeps_session_alive() {
    let fx = Fixture::new();
    let (out, result) = fx.serve(1, "Root /repo\nFrobnicate now\nNoop\n").await;
    result.unwrap();
    assert_eq!(out, "error unrecognized request `Frobnicate'\nok\n");
}

#[tokio::test]
async fn pipelined_commands_reset_between() {
    let fx = Fixture::new();
    let input = format!(
        "{}Entry /foo/1.1///\nUnchanged foo\nupdate\n{}update\n",
        PREFIX, PREFIX
    );
    let (out, result) = fx.serve(1, &input).await;
    result.unwrap();
    // The second command starts over: no entries, so foo comes down again.
    assert!(out.starts_with("ok\n"));
    assert!(out[3..].contains("/repo/mod/foo\n"));
}

#[tokio::test]
async fn bad_checksum_leaves_no_file() {
    let tmp = TempDir::new().unwrap();
    let script = format!(
        "Checksum {}\nUpdated mod/\n/repo/mod/foo\n/foo/1.1///\nu=rw,g=r,o=r\n6\nhello\nok\n",
        checksum_hex(b"something else")
    );
    let mut conn = Connection::new(script.as_bytes(), tokio::io::sink());
    let mut dispatcher = ResponseDispatcher::new(tmp.path(), ":local:/repo", "/repo");
    let completion = dispatcher.run(&mut conn).await.unwrap();

    assert_eq!(completion, Completion::Ok);
    assert!(!tmp.path().join("mod/foo").exists());
    assert_eq!(dispatcher.failures().len(), 1);
    assert!(dispatcher.pending_checksum().is_none());
}

#[tokio::test]
async fn good_checksum_writes_file_and_entry() {
    let tmp = TempDir::new().unwrap();
    let script = format!(
        "Mod-time 18 Oct 2026 12:00:00 -0000\nChecksum {}\nUpdated mod/\n/repo/mod/foo\n/foo/1.1///\nu=rw,g=r,o=r\n6\nhello\nok\n",
        checksum_hex(b"hello\n")
    );
    let mut conn = Connection::new(script.as_bytes(), tokio::io::sink());
    let mut dispatcher = ResponseDispatcher::new(tmp.path(), ":local:/repo", "/repo");
    assert_eq!(dispatcher.run(&mut conn).await.unwrap(), Completion::Ok);
    dispatcher.close().unwrap();

    assert_eq!(fs::read_to_string(tmp.path().join("mod/foo")).unwrap(), "hello\n");
    let entries = Entries::open(&tmp.path().join("mod"), OpenMode::Read).unwrap();
    assert_eq!(entries.get("foo").unwrap().revision, "1.1");
}

/// Run one client command against a server task over an in-memory pipe.
async fn round_trip(fx: &Fixture, session: u64, dir: &Path, req: CommandRequest) -> client::Outcome {
    let (client_end, server_end) = tokio::io::duplex(256 * 1024);
    let env = fx.env.clone();
    let mut locks = fx.locks.clone();
    let server = tokio::spawn(async move {
        let (r, w) = tokio::io::split(server_end);
        let mut conn = Connection::new(r, w);
        serve_session(&mut conn, &env, &mut locks, OwnerId::new(1, session)).await
    });

    let (r, w) = tokio::io::split(client_end);
    let mut conn = Connection::new(r, w);
    let opts = ClientOptions {
        capture: true,
        ..ClientOptions::default()
    };
    let outcome = client::converse(&mut conn, dir, &CvsRoot::local("/repo"), &opts, &req)
        .await
        .unwrap();
    drop(conn);
    server.await.unwrap().unwrap();
    outcome
}

#[tokio::test]
async fn checkout_then_commit() {
    let fx = Fixture::new();
    let tmp = TempDir::new().unwrap();

    let co = round_trip(&fx, 1, tmp.path(), CommandRequest::new("checkout", vec!["mod".into()])).await;
    assert!(co.success(), "{:?}", co);
    let work = tmp.path().join("mod");
    assert_eq!(fs::read_to_string(work.join("foo")).unwrap(), "hello\n");
    assert_eq!(fs::read_to_string(work.join("sub/bar")).unwrap(), "bar\n");
    assert!(work.join("CVS/Repository").is_file());

    fs::write(work.join("foo"), "changed\n").unwrap();
    filetime::set_file_mtime(work.join("foo"), filetime::FileTime::from_unix_time(1_000_000, 0)).unwrap();

    let ci = round_trip(
        &fx,
        2,
        &work,
        CommandRequest::new("commit", vec!["-m".into(), "change".into()]),
    )
    .await;
    assert!(ci.success(), "{:?}", ci);
    assert_eq!(fx.store.head("mod/foo").unwrap().unwrap().number, "1.2");
    assert_eq!(&fx.store.checkout("mod/foo", "1.2").unwrap()[..], b"changed\n");

    let entries = Entries::open(&work, OpenMode::Read).unwrap();
    assert_eq!(entries.get("foo").unwrap().revision, "1.2");

    // Nothing left to do.
    let up = round_trip(&fx, 3, &work, CommandRequest::new("update", Vec::new())).await;
    assert!(up.success(), "{:?}", up);
    assert!(up.transcript.unwrap().stdout.is_empty());
}

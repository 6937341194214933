//! Response dispatcher: applies server responses to the working copy.
//!
//! The dispatcher keeps three one-shot slots (`Checksum`, `Mod-time`,
//! `Mode`) filled by their responses and consumed by the next file-creating
//! response, matched or not. `MT` scopes nest on a stack. Everything else is
//! applied directly to the files, the Entries of each directory and the
//! in-memory [`WorkingTree`].

use crate::admin;
use crate::entries::{Entries, EntryRecord, EntryTimestamp, OpenMode};
use crate::error::{CvsError, ProtocolError, Result};
use crate::protocol::{checksum_hex, parse_checksum, parse_mode, split_line, Connection};
use crate::timestamp;
use crate::worktree::{classify, NodeKind, WorkingTree};
use bytes::Bytes;
use std::collections::btree_map::Entry as MapEntry;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::io::{AsyncRead, AsyncWrite};

/// How a `Patched`/`Rcs-diff` payload is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchFormat {
    /// `Patched`
    Context,
    /// `Rcs-diff`
    Rcs,
}

/// Applies a patch payload to the current contents of a file.
pub trait Patcher: Send + Sync {
    fn apply(&self, path: &Path, original: &[u8], patch: &[u8], format: PatchFormat) -> Result<Bytes>;
}

/// Takes a `Patched` payload as the complete new contents; refuses RCS diffs.
#[derive(Debug, Default, Clone, Copy)]
pub struct ReplacePatcher;

impl Patcher for ReplacePatcher {
    fn apply(&self, path: &Path, _original: &[u8], patch: &[u8], format: PatchFormat) -> Result<Bytes> {
        match format {
            PatchFormat::Context => Ok(Bytes::copy_from_slice(patch)),
            PatchFormat::Rcs => Err(CvsError::Io(io::Error::new(
                io::ErrorKind::Unsupported,
                format!("cannot apply an RCS diff to {}", path.display()),
            ))),
        }
    }
}

/// How a command finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    Ok,
    Error(String),
}

/// A file the dispatcher could not bring up to date.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub path: PathBuf,
    pub message: String,
}

/// Captured `M`/`E` output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Transcript {
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

pub struct ResponseDispatcher {
    base: PathBuf,
    /// Written to `CVS/Root` of new directories.
    root_spec: String,
    /// Repository root path; prefix of every repository path line.
    root_path: String,
    tree: WorkingTree,
    entries: BTreeMap<PathBuf, Entries>,
    pending_checksum: Option<String>,
    pending_mod_time: Option<i64>,
    pending_mode: Option<u32>,
    mt_stack: Vec<String>,
    mt_line: String,
    valid_requests: Option<HashSet<String>>,
    modules: Vec<String>,
    failures: Vec<FileFailure>,
    capture: Option<Transcript>,
    patcher: Box<dyn Patcher>,
}

fn malformed(what: &'static str, line: &str) -> CvsError {
    ProtocolError::Malformed {
        what,
        line: line.to_string(),
    }
    .into()
}

/// Client directory from a response argument, `.` for the top.
fn normalize_dir(dir: &str) -> Result<String> {
    let trimmed = dir.trim_end_matches('/');
    let trimmed = trimmed.strip_prefix("./").unwrap_or(trimmed);
    if trimmed.is_empty() || trimmed == "." {
        return Ok(".".to_string());
    }
    let path = Path::new(trimmed);
    if path.is_absolute()
        || path
            .components()
            .any(|c| matches!(c, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(malformed("directory (escapes working copy)", dir));
    }
    Ok(trimmed.to_string())
}

/// Last segment of a repository path line.
fn file_name(repo_path: &str) -> Result<&str> {
    match repo_path.rsplit('/').next() {
        Some(name) if !name.is_empty() && name != "." && name != ".." => Ok(name),
        _ => Err(malformed("repository path", repo_path)),
    }
}

fn remove_if_exists(path: &Path) -> Result<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(CvsError::io_at(path, e)),
    }
}

fn mtime_of(path: &Path) -> Option<i64> {
    fs::metadata(path).ok().map(|m| timestamp::mtime_secs(&m))
}

/// Write through a temp file in the same directory, then rename into place.
fn write_atomic(dir: &Path, path: &Path, data: &[u8], mode: u32, mod_time: Option<i64>) -> Result<()> {
    let mut tmp = NamedTempFile::new_in(dir).map_err(|e| CvsError::io_at(dir, e))?;
    tmp.write_all(data).map_err(|e| CvsError::io_at(path, e))?;
    tmp.persist(path).map_err(|e| CvsError::io_at(path, e.error))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        if let Err(e) = fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777)) {
            tracing::warn!("Failed to set permissions on {}: {}", path.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = mode;

    if let Some(t) = mod_time {
        filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(t, 0))
            .map_err(|e| CvsError::io_at(path, e))?;
    }
    Ok(())
}

impl ResponseDispatcher {
    pub fn new(base: &Path, root_spec: &str, root_path: &str) -> Self {
        Self {
            base: base.to_path_buf(),
            root_spec: root_spec.to_string(),
            root_path: root_path.trim_end_matches('/').to_string(),
            tree: WorkingTree::new(base),
            entries: BTreeMap::new(),
            pending_checksum: None,
            pending_mod_time: None,
            pending_mode: None,
            mt_stack: Vec::new(),
            mt_line: String::new(),
            valid_requests: None,
            modules: Vec::new(),
            failures: Vec::new(),
            capture: None,
            patcher: Box::new(ReplacePatcher),
        }
    }

    /// Start from an already scanned tree instead of an empty one.
    pub fn with_tree(mut self, tree: WorkingTree) -> Self {
        self.tree = tree;
        self
    }

    pub fn with_patcher(mut self, patcher: Box<dyn Patcher>) -> Self {
        self.patcher = patcher;
        self
    }

    /// Collect `M`/`E` output instead of printing it.
    pub fn capture_output(mut self) -> Self {
        self.capture = Some(Transcript::default());
        self
    }

    pub fn tree(&self) -> &WorkingTree {
        &self.tree
    }

    pub fn failures(&self) -> &[FileFailure] {
        &self.failures
    }

    pub fn transcript(&self) -> Option<&Transcript> {
        self.capture.as_ref()
    }

    pub fn valid_requests(&self) -> Option<&HashSet<String>> {
        self.valid_requests.as_ref()
    }

    pub fn modules(&self) -> &[String] {
        &self.modules
    }

    pub fn pending_checksum(&self) -> Option<&str> {
        self.pending_checksum.as_deref()
    }

    pub fn mt_depth(&self) -> usize {
        self.mt_stack.len()
    }

    /// Read responses until `ok` or `error`.
    pub async fn run<R, W>(&mut self, conn: &mut Connection<R, W>) -> Result<Completion>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            let line = conn.expect_line().await?;
            if let Some(done) = self.handle(conn, &line).await? {
                return Ok(done);
            }
        }
    }

    /// Apply one response; `Some` once the command has finished.
    pub async fn handle<R, W>(&mut self, conn: &mut Connection<R, W>, line: &str) -> Result<Option<Completion>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let (name, arg) = split_line(line);
        match name {
            "ok" => return Ok(Some(Completion::Ok)),
            "error" => return Ok(Some(Completion::Error(arg.trim().to_string()))),
            "Valid-requests" => {
                self.valid_requests = Some(arg.split_whitespace().map(str::to_string).collect());
            }
            "Checksum" => {
                if self.pending_checksum.replace(parse_checksum(arg)?).is_some() {
                    tracing::warn!("Checksum response not followed by a file; replacing it");
                }
            }
            "Mod-time" => match timestamp::parse_mod_time(arg) {
                Some(t) => self.pending_mod_time = Some(t),
                None => tracing::warn!("Ignoring unparseable Mod-time {}", arg),
            },
            "Mode" => self.pending_mode = Some(parse_mode(arg)?),
            "M" => self.print(arg),
            "E" => self.eprint(arg),
            "F" => {
                if self.capture.is_none() {
                    if let Err(e) = io::stdout().flush() {
                        tracing::debug!("stdout flush failed: {}", e);
                    }
                }
            }
            "Mbinary" => {
                let data = conn.recv_payload().await?;
                match self.capture.as_mut() {
                    Some(t) => t.stdout.push(String::from_utf8_lossy(&data).into_owned()),
                    None => io::stdout().write_all(&data)?,
                }
            }
            "MT" => self.tagged(arg)?,
            "Checked-in" | "New-entry" => {
                let repo = conn.expect_line().await?;
                let entry = conn.expect_line().await?;
                self.checked_in(arg, &repo, &entry, name == "New-entry")?;
            }
            "Updated" | "Created" | "Update-existing" | "Merged" | "Patched" | "Rcs-diff" => {
                let repo = conn.expect_line().await?;
                let entry = conn.expect_line().await?;
                let (mode, data) = conn.recv_file().await?;
                self.receive_file(name, arg, &repo, &entry, mode, data)?;
            }
            "Removed" | "Remove-entry" => {
                let repo = conn.expect_line().await?;
                self.removed(arg, &repo, name == "Removed")?;
            }
            "Copy-file" => {
                let repo = conn.expect_line().await?;
                let new_name = conn.expect_line().await?;
                self.copy_file(arg, &repo, &new_name)?;
            }
            "Set-static-directory" | "Clear-static-directory" => {
                let repo = conn.expect_line().await?;
                self.static_dir(arg, &repo, name == "Set-static-directory")?;
            }
            "Set-sticky" => {
                let repo = conn.expect_line().await?;
                let tag = conn.expect_line().await?;
                let dir = self.ensure_dir(arg, &repo)?;
                admin::write_tag(&dir, Some(&tag))?;
            }
            "Clear-sticky" => {
                let repo = conn.expect_line().await?;
                let dir = self.ensure_dir(arg, &repo)?;
                admin::write_tag(&dir, None)?;
            }
            "Template" => {
                let _repo = conn.expect_line().await?;
                let payload = conn.recv_payload().await?;
                tracing::debug!("Discarding {} byte template for {}", payload.len(), arg);
            }
            "Notified" => {
                conn.expect_line().await?;
            }
            "Module-expansion" => self.modules.push(arg.to_string()),
            _ => return Err(malformed("response", line)),
        }
        Ok(None)
    }

    fn print(&mut self, line: &str) {
        match self.capture.as_mut() {
            Some(t) => t.stdout.push(line.to_string()),
            None => println!("{}", line),
        }
    }

    fn eprint(&mut self, line: &str) {
        match self.capture.as_mut() {
            Some(t) => t.stderr.push(line.to_string()),
            None => eprintln!("{}", line),
        }
    }

    fn tagged(&mut self, arg: &str) -> Result<()> {
        if let Some(name) = arg.strip_prefix('+') {
            let name = name.split_whitespace().next().unwrap_or_default();
            self.mt_stack.push(name.to_string());
            return Ok(());
        }
        if let Some(name) = arg.strip_prefix('-') {
            let name = name.split_whitespace().next().unwrap_or_default();
            match self.mt_stack.pop() {
                Some(top) if top == name => {}
                top => {
                    return Err(ProtocolError::ScopeMismatch {
                        expected: top.unwrap_or_default(),
                        got: name.to_string(),
                    }
                    .into())
                }
            }
            if self.mt_stack.is_empty() && !self.mt_line.is_empty() {
                let line = std::mem::take(&mut self.mt_line);
                self.print(&line);
            }
            return Ok(());
        }
        let (tag, text) = split_line(arg);
        if tag == "newline" {
            let line = std::mem::take(&mut self.mt_line);
            self.print(&line);
        } else {
            self.mt_line.push_str(text);
        }
        Ok(())
    }

    fn fail(&mut self, path: &Path, message: String) {
        tracing::warn!("{}: {}", path.display(), message);
        self.eprint(&format!("rcvs: {}: {}", path.display(), message));
        self.failures.push(FileFailure {
            path: path.to_path_buf(),
            message,
        });
    }

    /// Repository directory (relative to the root when possible) holding
    /// the file named by a repository path line.
    fn repository_of(&self, repo_path: &str) -> String {
        let dir = repo_path.rsplit_once('/').map_or("", |(d, _)| d);
        if dir == self.root_path {
            return ".".to_string();
        }
        dir.strip_prefix(self.root_path.as_str())
            .and_then(|r| r.strip_prefix('/'))
            .unwrap_or(dir)
            .to_string()
    }

    fn dir_path(&self, rel: &str) -> PathBuf {
        if rel == "." {
            self.base.clone()
        } else {
            self.base.join(rel)
        }
    }

    fn entries_for(&mut self, dir: &Path) -> Result<&mut Entries> {
        match self.entries.entry(dir.to_path_buf()) {
            MapEntry::Occupied(o) => Ok(o.into_mut()),
            MapEntry::Vacant(v) => Ok(v.insert(Entries::open(dir, OpenMode::Write)?)),
        }
    }

    /// Make sure the client directory exists and carries admin files.
    fn ensure_dir(&mut self, dir: &str, repo_path: &str) -> Result<PathBuf> {
        let rel = normalize_dir(dir)?;
        let path = self.dir_path(&rel);
        if !admin::is_admin_dir(&path) {
            fs::create_dir_all(&path).map_err(|e| CvsError::io_at(&path, e))?;
            let repository = self.repository_of(repo_path);
            admin::create_admin_dir(&path, &self.root_spec, &repository, None)?;
            tracing::debug!("Created working directory {} for {}", path.display(), repository);

            if rel != "." {
                let (parent, name) = rel.rsplit_once('/').unwrap_or((".", rel.as_str()));
                let parent_path = self.dir_path(parent);
                if admin::is_admin_dir(&parent_path) {
                    self.entries_for(&parent_path)?.add(EntryRecord::dir(name));
                }
            }
        }
        self.tree.ensure_dir_path(&rel);
        Ok(path)
    }

    fn record_entry(&mut self, dir_path: &Path, rel: &str, entry: EntryRecord, mtime: Option<i64>) -> Result<()> {
        let d = self.tree.ensure_dir_path(rel);
        let id = self.tree.ensure_child(d, &entry.name, NodeKind::File);
        let node = self.tree.node_mut(id);
        node.apply_entry(&entry);
        node.mtime = mtime;
        node.status = classify(Some(&entry), mtime);
        self.entries_for(dir_path)?.add(entry);
        Ok(())
    }

    fn checked_in(&mut self, dir: &str, repo: &str, entry_line: &str, new_entry: bool) -> Result<()> {
        let dir_path = self.ensure_dir(dir, repo)?;
        let mut entry = EntryRecord::parse(entry_line)?.ok_or_else(|| malformed("entry", entry_line))?;
        let on_disk = mtime_of(&dir_path.join(&entry.name));
        if new_entry {
            entry.checkout_timestamp = EntryTimestamp::Dummy;
        } else if matches!(&entry.checkout_timestamp, EntryTimestamp::Other(s) if s.is_empty()) {
            entry.checkout_timestamp = on_disk.map_or(EntryTimestamp::Dummy, EntryTimestamp::At);
        }
        tracing::debug!("Entry for {}: {}", dir_path.join(&entry.name).display(), entry);
        self.record_entry(&dir_path, &normalize_dir(dir)?, entry, on_disk)
    }

    fn receive_file(
        &mut self,
        kind: &str,
        dir: &str,
        repo: &str,
        entry_line: &str,
        mode: u32,
        data: Bytes,
    ) -> Result<()> {
        // Slots are consumed by this response whatever happens next.
        let checksum = self.pending_checksum.take();
        let mod_time = self.pending_mod_time.take();
        let mode = self.pending_mode.take().unwrap_or(mode);

        let dir_path = self.ensure_dir(dir, repo)?;
        let mut entry = EntryRecord::parse(entry_line)?.ok_or_else(|| malformed("entry", entry_line))?;
        let path = dir_path.join(&entry.name);

        let contents = match kind {
            "Patched" | "Rcs-diff" => {
                let format = if kind == "Patched" {
                    PatchFormat::Context
                } else {
                    PatchFormat::Rcs
                };
                let original = fs::read(&path).unwrap_or_default();
                match self.patcher.apply(&path, &original, &data, format) {
                    Ok(patched) => patched,
                    Err(e) => {
                        self.fail(&path, e.to_string());
                        return Ok(());
                    }
                }
            }
            _ => data,
        };

        if let Some(expected) = checksum {
            let actual = checksum_hex(&contents);
            if actual != expected {
                let err = CvsError::Checksum {
                    path: path.clone(),
                    expected,
                    actual,
                };
                tracing::error!("{}", err);
                remove_if_exists(&path)?;
                self.entries_for(&dir_path)?.remove(&entry.name);
                self.fail(&path, err.to_string());
                return Ok(());
            }
        }

        if let Err(e) = write_atomic(&dir_path, &path, &contents, mode, mod_time) {
            if e.is_fatal() {
                return Err(e);
            }
            self.fail(&path, e.to_string());
            return Ok(());
        }

        let on_disk = mtime_of(&path);
        entry.checkout_timestamp = if kind == "Merged" {
            EntryTimestamp::ResultOfMerge
        } else {
            on_disk.map_or(EntryTimestamp::Dummy, EntryTimestamp::At)
        };
        tracing::debug!("{} {} ({} bytes)", kind, path.display(), contents.len());
        self.record_entry(&dir_path, &normalize_dir(dir)?, entry, on_disk)
    }

    fn removed(&mut self, dir: &str, repo: &str, delete_file: bool) -> Result<()> {
        let rel = normalize_dir(dir)?;
        let dir_path = self.dir_path(&rel);
        let name = file_name(repo)?.to_string();
        let path = dir_path.join(&name);
        if delete_file {
            if let Err(e) = remove_if_exists(&path) {
                self.fail(&path, e.to_string());
                return Ok(());
            }
        }
        if admin::is_admin_dir(&dir_path) {
            self.entries_for(&dir_path)?.remove(&name);
        }
        let d = self.tree.ensure_dir_path(&rel);
        if let Some(id) = self.tree.child(d, &name) {
            self.tree.detach(id);
        }
        Ok(())
    }

    fn copy_file(&mut self, dir: &str, repo: &str, new_name: &str) -> Result<()> {
        let dir_path = self.dir_path(&normalize_dir(dir)?);
        let from = dir_path.join(file_name(repo)?);
        let to = dir_path.join(file_name(new_name)?);
        if let Err(e) = fs::copy(&from, &to) {
            self.fail(&from, e.to_string());
        }
        Ok(())
    }

    fn static_dir(&mut self, dir: &str, repo: &str, set: bool) -> Result<()> {
        let dir_path = self.ensure_dir(dir, repo)?;
        let marker = dir_path.join(crate::entries::ADMIN_DIR).join("Entries.Static");
        if set {
            fs::write(&marker, b"").map_err(|e| CvsError::io_at(&marker, e))?;
        } else {
            remove_if_exists(&marker)?;
        }
        Ok(())
    }

    /// Flush and close every Entries handle opened while dispatching.
    pub fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for (dir, handle) in std::mem::take(&mut self.entries) {
            if let Err(e) = handle.close() {
                tracing::error!("Failed to write entries of {}: {}", dir.display(), e);
                first_err.get_or_insert(e);
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Drop for ResponseDispatcher {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            if let Err(e) = self.close() {
                tracing::error!("Entries not saved: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entries::ADMIN_DIR;
    use crate::worktree::FileStatus;
    use tempfile::TempDir;

    async fn feed(d: &mut ResponseDispatcher, wire: &[u8]) -> Result<Completion> {
        let mut conn = Connection::new(wire, tokio::io::sink());
        d.run(&mut conn).await
    }

    fn dispatcher(tmp: &TempDir) -> ResponseDispatcher {
        ResponseDispatcher::new(tmp.path(), ":local:/repo", "/repo").capture_output()
    }

    fn updated(dir: &str, name: &str, rev: &str, data: &str, checksum: Option<&str>) -> Vec<u8> {
        let mut wire = String::new();
        if let Some(c) = checksum {
            wire.push_str(&format!("Checksum {}\n", c));
        }
        wire.push_str(&format!(
            "Updated {}/\n/repo/mod/{}\n/{}/{}///\n420\n{}\n{}",
            dir,
            name,
            name,
            rev,
            data.len(),
            data
        ));
        wire.into_bytes()
    }

    #[tokio::test]
    async fn test_updated_with_checksum_creates_file() {
        let tmp = TempDir::new().unwrap();
        let mut d = dispatcher(&tmp);
        let mut wire = updated("mod", "foo", "1.1", "hello\n", Some(&checksum_hex(b"hello\n")));
        wire.extend_from_slice(b"ok\n");

        assert_eq!(feed(&mut d, &wire).await.unwrap(), Completion::Ok);
        d.close().unwrap();

        let file = tmp.path().join("mod/foo");
        assert_eq!(fs::read(&file).unwrap(), b"hello\n".to_vec());
        assert_eq!(admin::read_repository(&tmp.path().join("mod")).unwrap().as_deref(), Some("mod"));
        let entries = Entries::open(&tmp.path().join("mod"), OpenMode::Read).unwrap();
        let entry = entries.get("foo").unwrap();
        assert_eq!(entry.revision, "1.1");
        assert_eq!(classify(Some(entry), mtime_of(&file)), FileStatus::UpToDate);
        assert!(d.pending_checksum().is_none());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_discards_file() {
        let tmp = TempDir::new().unwrap();
        let mut d = dispatcher(&tmp);
        let mut wire = updated("mod", "bad", "1.1", "tampered", Some(&checksum_hex(b"original")));
        // Slot was consumed: the next file carries no checksum and lands.
        wire.extend(updated("mod", "good", "1.1", "fine", None));
        wire.extend_from_slice(b"ok\n");

        assert_eq!(feed(&mut d, &wire).await.unwrap(), Completion::Ok);
        d.close().unwrap();

        assert!(!tmp.path().join("mod/bad").exists());
        assert!(tmp.path().join("mod/good").exists());
        assert_eq!(d.failures().len(), 1);
        assert!(d.pending_checksum().is_none());
        let entries = Entries::open(&tmp.path().join("mod"), OpenMode::Read).unwrap();
        assert!(entries.get("bad").is_none());
    }

    #[tokio::test]
    async fn test_empty_file_payload() {
        let tmp = TempDir::new().unwrap();
        let mut d = dispatcher(&tmp);
        let mut wire = updated(".", "empty", "1.1", "", None);
        wire.extend_from_slice(b"ok\n");
        feed(&mut d, &wire).await.unwrap();
        assert_eq!(fs::metadata(tmp.path().join("empty")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn test_mt_scopes() {
        let tmp = TempDir::new().unwrap();
        let mut d = dispatcher(&tmp);
        let wire = b"MT +updated\nMT text U \nMT fname foo.c\nMT newline\nMT -updated\nok\n";
        feed(&mut d, wire).await.unwrap();
        assert_eq!(d.transcript().unwrap().stdout, vec!["U foo.c".to_string()]);
        assert_eq!(d.mt_depth(), 0);

        let err = feed(&mut d, b"MT +a\nMT +b\nMT -a\n").await.unwrap_err();
        assert!(matches!(err, CvsError::Protocol(ProtocolError::ScopeMismatch { .. })));
    }

    #[tokio::test]
    async fn test_removed_and_checked_in() {
        let tmp = TempDir::new().unwrap();
        let mut d = dispatcher(&tmp);
        let mut wire = updated(".", "gone", "1.1", "x", None);
        wire.extend(updated(".", "kept", "1.1", "y", None));
        wire.extend_from_slice(b"ok\n");
        feed(&mut d, &wire).await.unwrap();

        let wire = b"Removed ./\n/repo/mod/gone\nChecked-in ./\n/repo/mod/kept\n/kept/1.2///\nM done\nerror \n";
        assert_eq!(feed(&mut d, wire).await.unwrap(), Completion::Error(String::new()));
        d.close().unwrap();

        assert!(!tmp.path().join("gone").exists());
        let entries = Entries::open(tmp.path(), OpenMode::Read).unwrap();
        assert!(entries.get("gone").is_none());
        let kept = entries.get("kept").unwrap();
        assert_eq!(kept.revision, "1.2");
        assert!(matches!(kept.checkout_timestamp, EntryTimestamp::At(_)));
        assert!(tmp.path().join(ADMIN_DIR).join("Root").is_file());
        assert_eq!(d.transcript().unwrap().stdout, vec!["done".to_string()]);
    }

    #[tokio::test]
    async fn test_rejects_escaping_directory() {
        let tmp = TempDir::new().unwrap();
        let mut d = dispatcher(&tmp);
        let err = feed(&mut d, &updated("../out", "x", "1.1", "x", None)).await.unwrap_err();
        assert!(err.is_fatal());
    }

    #[tokio::test]
    async fn test_unknown_response_is_fatal() {
        let tmp = TempDir::new().unwrap();
        let mut d = dispatcher(&tmp);
        assert!(feed(&mut d, b"Bogus thing\n").await.unwrap_err().is_fatal());
    }
}

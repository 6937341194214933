//! Per-connection server state.
//!
//! Everything the client tells us before a command (root, directories,
//! entries, file claims, arguments) accumulates here. Entries go to a
//! scratch copy of each client directory so they can be flushed and read
//! back like any other Entry Store.

use crate::entries::{Entries, EntryKind, EntryRecord, EntryTimestamp, OpenMode};
use crate::error::{CvsError, ProtocolError, Result};
use crate::worktree::{classify, FileStatus, NodeKind, WorkingTree};
use bytes::Bytes;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// `Global_option` flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalOptions {
    pub quiet: bool,
    pub really_quiet: bool,
    /// `-n`: report what would happen, change nothing.
    pub noop: bool,
    pub no_history: bool,
    pub read_only: bool,
    pub trace: bool,
}

impl GlobalOptions {
    /// Apply one `-x` option; false if the letter is unknown.
    pub fn apply(&mut self, opt: &str) -> bool {
        match opt {
            "-q" => self.quiet = true,
            "-Q" => {
                self.quiet = true;
                self.really_quiet = true;
            }
            "-n" => self.noop = true,
            "-l" => self.no_history = true,
            "-r" => self.read_only = true,
            "-t" => self.trace = true,
            _ => return false,
        }
        true
    }
}

/// What the client said about one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    Unchanged,
    /// Contents were sent.
    Modified { mode: u32, data: Bytes },
    /// `Is-modified`: changed, contents not sent.
    IsModified,
    Questionable,
}

/// One client directory named by a `Directory` request.
pub struct DirState {
    /// Client-side path, `.` for the top.
    pub local: String,
    /// Repository-relative path, `.` for the repository root.
    pub repo: String,
    pub sticky: Option<String>,
    pub static_dir: bool,
    entries: Entries,
    claims: BTreeMap<String, Claim>,
    scratch: PathBuf,
}

impl DirState {
    pub fn entries(&self) -> &Entries {
        &self.entries
    }

    pub fn claim(&self, name: &str) -> Option<&Claim> {
        self.claims.get(name)
    }

    /// Names the client mentioned, by entry or by claim.
    pub fn names(&self) -> BTreeSet<String> {
        self.entries
            .iter()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.name.clone())
            .chain(self.claims.keys().cloned())
            .collect()
    }

    /// Client-side status of one file, from its entry and claim.
    ///
    /// A file with an entry but no claim was not sent at all: it is missing
    /// from the working copy.
    pub fn status(&self, name: &str) -> FileStatus {
        let entry = self.entries.get(name);
        match self.claims.get(name) {
            Some(Claim::Questionable) if entry.is_none() => FileStatus::Unknown,
            Some(Claim::Unchanged) if entry.is_some_and(|e| e.conflict_timestamp.is_some()) => {
                FileStatus::Conflict
            }
            claim => classify(entry, claim.map(|_| 0)),
        }
    }

    /// Repository-relative path of a file in this directory.
    pub fn repo_file(&self, name: &str) -> String {
        if self.repo == "." {
            name.to_string()
        } else {
            format!("{}/{}", self.repo, name)
        }
    }

    /// Where the scratch copy of a file lives.
    pub fn scratch_file(&self, name: &str) -> PathBuf {
        self.scratch.join(name)
    }

    fn cloned_entry(&self, name: &str) -> Option<EntryRecord> {
        self.entries.get(name).cloned()
    }
}

/// Request-accumulated state of one connection.
pub struct Session {
    root: Option<String>,
    pub valid_responses: Option<HashSet<String>>,
    pub global: GlobalOptions,
    pub args: Vec<String>,
    pub max_dotdot: u32,
    dirs: BTreeMap<String, DirState>,
    current: Option<String>,
    pending_kopt: Option<String>,
    pending_checkin_time: Option<i64>,
    deferred: Vec<String>,
    /// Where scratch directories are made; the system temp dir when `None`.
    scratch_base: Option<PathBuf>,
    scratch: TempDir,
}

/// Reject names that would leave the directory they are sent for.
fn check_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') || name.contains('\0') {
        return Err(ProtocolError::Malformed {
            what: "file name",
            line: name.to_string(),
        }
        .into());
    }
    Ok(())
}

fn normalize_local(local: &str) -> String {
    let trimmed = local.trim_end_matches('/');
    if trimmed.is_empty() {
        ".".to_string()
    } else {
        trimmed.strip_prefix("./").unwrap_or(trimmed).to_string()
    }
}

impl Session {
    pub fn new() -> Result<Self> {
        Self::new_in(None)
    }

    /// A session whose scratch space lives under `base`.
    pub fn new_in(base: Option<&Path>) -> Result<Self> {
        let scratch = match base {
            Some(dir) => tempfile::Builder::new()
                .prefix("session-")
                .tempdir_in(dir)
                .map_err(|e| CvsError::io_at(dir, e))?,
            None => TempDir::new()?,
        };
        Ok(Self {
            root: None,
            valid_responses: None,
            global: GlobalOptions::default(),
            args: Vec::new(),
            max_dotdot: 0,
            dirs: BTreeMap::new(),
            current: None,
            pending_kopt: None,
            pending_checkin_time: None,
            deferred: Vec::new(),
            scratch_base: base.map(Path::to_path_buf),
            scratch,
        })
    }

    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn set_root(&mut self, root: &str) -> Result<()> {
        if self.root.is_some() {
            return Err(ProtocolError::DuplicateRoot.into());
        }
        self.root = Some(root.trim_end_matches('/').to_string());
        Ok(())
    }

    /// Whether the client accepts a response (all, if it never said).
    pub fn accepts(&self, response: &str) -> bool {
        self.valid_responses
            .as_ref()
            .map_or(true, |v| v.contains(response))
    }

    /// Switch to a client directory; true on its first mention.
    pub fn enter_directory(&mut self, local: &str, repo: &str) -> Result<bool> {
        let local = normalize_local(local);
        if local.starts_with('/') || local.split('/').any(|seg| seg == "..") {
            return Err(ProtocolError::Malformed {
                what: "directory",
                line: local,
            }
            .into());
        }
        if let Some(dir) = self.dirs.get_mut(&local) {
            dir.repo = repo.to_string();
            self.current = Some(local);
            return Ok(false);
        }

        let scratch = if local == "." {
            self.scratch.path().to_path_buf()
        } else {
            self.scratch.path().join(&local)
        };
        fs::create_dir_all(&scratch).map_err(|e| CvsError::io_at(&scratch, e))?;
        let entries = Entries::open(&scratch, OpenMode::Write)?;
        tracing::debug!("Directory {} -> repository {}", local, repo);

        self.dirs.insert(
            local.clone(),
            DirState {
                local: local.clone(),
                repo: repo.to_string(),
                sticky: None,
                static_dir: false,
                entries,
                claims: BTreeMap::new(),
                scratch,
            },
        );
        self.current = Some(local);
        Ok(true)
    }

    fn current_mut(&mut self, request: &str) -> Result<&mut DirState> {
        let key = self.current.clone().ok_or_else(|| ProtocolError::OutOfOrder {
            request: request.to_string(),
            expected: "Directory",
        })?;
        self.dirs.get_mut(&key).ok_or_else(|| {
            CvsError::from(ProtocolError::OutOfOrder {
                request: request.to_string(),
                expected: "Directory",
            })
        })
    }

    pub fn current(&self) -> Option<&DirState> {
        self.current.as_ref().and_then(|k| self.dirs.get(k))
    }

    pub fn add_entry(&mut self, line: &str) -> Result<()> {
        let dir = self.current_mut("Entry")?;
        match EntryRecord::parse(line)? {
            Some(rec) => dir.entries.add(rec),
            None => dir.entries.set_subdirs_complete(),
        }
        Ok(())
    }

    pub fn set_sticky(&mut self, tag: &str) -> Result<()> {
        self.current_mut("Sticky")?.sticky = Some(tag.to_string());
        Ok(())
    }

    pub fn set_static(&mut self) -> Result<()> {
        self.current_mut("Static-directory")?.static_dir = true;
        Ok(())
    }

    pub fn set_kopt(&mut self, opt: &str) {
        self.pending_kopt = Some(opt.to_string());
    }

    pub fn set_checkin_time(&mut self, secs: i64) {
        self.pending_checkin_time = Some(secs);
    }

    pub fn checkin_time(&self) -> Option<i64> {
        self.pending_checkin_time
    }

    /// `Modified`: keep the contents and mark the entry modified.
    pub fn claim_modified(&mut self, name: &str, mode: u32, data: Bytes) -> Result<()> {
        check_name(name)?;
        let kopt = self.pending_kopt.take();
        let dir = self.current_mut("Modified")?;
        let path = dir.scratch_file(name);
        fs::write(&path, &data).map_err(|e| CvsError::io_at(&path, e))?;
        if let Some(mut rec) = dir.cloned_entry(name) {
            rec.checkout_timestamp = EntryTimestamp::Modified;
            if let Some(k) = kopt {
                rec.keyword_opts = k;
            }
            dir.entries.add(rec);
        }
        dir.claims.insert(name.to_string(), Claim::Modified { mode, data });
        Ok(())
    }

    pub fn claim_is_modified(&mut self, name: &str) -> Result<()> {
        check_name(name)?;
        let dir = self.current_mut("Is-modified")?;
        if let Some(mut rec) = dir.cloned_entry(name) {
            rec.checkout_timestamp = EntryTimestamp::Modified;
            dir.entries.add(rec);
        }
        dir.claims.insert(name.to_string(), Claim::IsModified);
        Ok(())
    }

    /// `Unchanged`: the client's copy matches its entry. Idempotent.
    pub fn claim_unchanged(&mut self, name: &str) -> Result<()> {
        check_name(name)?;
        let dir = self.current_mut("Unchanged")?;
        if let Some(mut rec) = dir.cloned_entry(name) {
            if rec.checkout_timestamp != EntryTimestamp::Unchanged {
                rec.checkout_timestamp = EntryTimestamp::Unchanged;
                dir.entries.add(rec);
            }
        }
        dir.claims.insert(name.to_string(), Claim::Unchanged);
        Ok(())
    }

    pub fn claim_questionable(&mut self, name: &str) -> Result<()> {
        check_name(name)?;
        let dir = self.current_mut("Questionable")?;
        dir.claims.insert(name.to_string(), Claim::Questionable);
        Ok(())
    }

    pub fn push_argument(&mut self, arg: &str) {
        self.args.push(arg.to_string());
    }

    /// `Argumentx`: continue the previous argument on a new line.
    pub fn extend_argument(&mut self, arg: &str) -> Result<()> {
        let last = self.args.last_mut().ok_or_else(|| ProtocolError::OutOfOrder {
            request: "Argumentx".to_string(),
            expected: "Argument",
        })?;
        last.push('\n');
        last.push_str(arg);
        Ok(())
    }

    /// Remember a non-fatal problem to report with the next command.
    pub fn defer_error(&mut self, message: String) {
        self.deferred.push(message);
    }

    pub fn take_deferred(&mut self) -> Vec<String> {
        std::mem::take(&mut self.deferred)
    }

    /// Write every directory's accumulated entries and reopen them read-only.
    pub fn flush_entries(&mut self) -> Result<()> {
        for dir in self.dirs.values_mut() {
            let handle = std::mem::replace(&mut dir.entries, Entries::in_memory(&dir.scratch));
            handle.close()?;
            dir.entries = Entries::open(&dir.scratch, OpenMode::Read)?;
        }
        Ok(())
    }

    pub fn dirs(&self) -> impl Iterator<Item = &DirState> {
        self.dirs.values()
    }

    pub fn dir(&self, local: &str) -> Option<&DirState> {
        self.dirs.get(&normalize_local(local))
    }

    /// Repository directories touched so far, sorted.
    pub fn repo_dirs(&self) -> Vec<String> {
        let set: BTreeSet<String> = self.dirs.values().map(|d| d.repo.clone()).collect();
        set.into_iter().collect()
    }

    pub fn scratch_path(&self) -> &Path {
        self.scratch.path()
    }

    /// The client's working copy as the server understands it.
    pub fn working_tree(&self) -> WorkingTree {
        let mut tree = WorkingTree::new(self.scratch.path());
        for dir in self.dirs.values() {
            let d = tree.ensure_dir_path(&dir.local);
            tree.node_mut(d).sticky_tag = dir.sticky.clone();
            for name in dir.names() {
                let id = tree.ensure_child(d, &name, NodeKind::File);
                let node = tree.node_mut(id);
                if let Some(e) = dir.entries.get(&name) {
                    node.apply_entry(e);
                }
                node.status = dir.status(&name);
                if let Some(Claim::Modified { mode, .. }) = dir.claims.get(&name) {
                    node.mode = *mode;
                }
            }
        }
        tree
    }

    /// Forget the finished command; the connection may start over with `Root`.
    pub fn reset(&mut self) -> Result<()> {
        let valid = self.valid_responses.take();
        let base = self.scratch_base.take();
        *self = Session::new_in(base.as_deref())?;
        self.valid_responses = valid;
        Ok(())
    }
}

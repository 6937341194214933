//! Command executors.
//!
//! A terminal request (`update`, `commit`, ...) is handed to a
//! [`CommandExecutor`] together with everything the session accumulated. The
//! executor answers with a list of [`Response`]s; the dispatcher puts them
//! on the wire.

use super::session::{Claim, DirState, Session};
use super::store::{BinaryDiff, DiffEngine, Revision, RevisionStore};
use crate::entries::{EntryRecord, EntryTimestamp};
use crate::worktree::FileStatus;
use bytes::Bytes;

/// Which file-creating response to send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Updated,
    Created,
    UpdateExisting,
    Merged,
}

impl UpdateKind {
    pub fn keyword(&self) -> &'static str {
        match self {
            UpdateKind::Updated => "Updated",
            UpdateKind::Created => "Created",
            UpdateKind::UpdateExisting => "Update-existing",
            UpdateKind::Merged => "Merged",
        }
    }
}

/// One server response. `dir` is the client-side directory, `repo_path` the
/// full repository path of the file (root included).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Ok,
    Error(String),
    M(String),
    E(String),
    MT(String),
    ValidRequests(String),
    CheckedIn {
        dir: String,
        repo_path: String,
        entry: EntryRecord,
    },
    NewEntry {
        dir: String,
        repo_path: String,
        entry: EntryRecord,
    },
    RemoveEntry {
        dir: String,
        repo_path: String,
    },
    Removed {
        dir: String,
        repo_path: String,
    },
    SetSticky {
        dir: String,
        repo_path: String,
        tag: String,
    },
    ClearSticky {
        dir: String,
        repo_path: String,
    },
    File {
        kind: UpdateKind,
        dir: String,
        repo_path: String,
        entry: EntryRecord,
        mode: u32,
        mod_time: Option<i64>,
        data: Bytes,
    },
}

impl Response {
    /// `ok` or `error` ends a command's responses.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Response::Ok | Response::Error(_))
    }
}

/// What an executor gets to see.
pub struct CommandContext<'a> {
    pub name: &'a str,
    pub session: &'a Session,
    /// Root as the client named it; prefixes repository paths in responses.
    pub root: &'a str,
    pub user: &'a str,
    pub store: &'a dyn RevisionStore,
}

impl CommandContext<'_> {
    pub fn repo_path(&self, repo_file: &str) -> String {
        if repo_file == "." {
            self.root.to_string()
        } else {
            format!("{}/{}", self.root, repo_file)
        }
    }
}

pub trait CommandExecutor: Send + Sync {
    fn execute(&self, ctx: &CommandContext<'_>) -> Vec<Response>;
}

/// Parsed command arguments.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandArgs {
    pub flags: Vec<String>,
    pub message: Option<String>,
    pub revision: Option<String>,
    pub date: Option<String>,
    pub kopt: Option<String>,
    /// `-l`: this directory only.
    pub local: bool,
    pub files: Vec<String>,
}

impl CommandArgs {
    pub fn parse(args: &[String]) -> Self {
        let mut out = CommandArgs::default();
        let mut iter = args.iter();
        while let Some(arg) = iter.next() {
            if arg == "--" {
                out.files.extend(iter.by_ref().cloned());
                break;
            }
            if !arg.starts_with('-') || arg.len() < 2 {
                out.files.push(arg.clone());
                continue;
            }
            let (flag, attached) = arg.split_at(2);
            let slot = match flag {
                "-m" => Some(&mut out.message),
                "-r" => Some(&mut out.revision),
                "-D" => Some(&mut out.date),
                "-k" => Some(&mut out.kopt),
                _ => None,
            };
            match slot {
                Some(slot) if !attached.is_empty() => *slot = Some(attached.to_string()),
                Some(slot) => *slot = iter.next().cloned(),
                None if arg == "-l" => out.local = true,
                None if arg == "-R" => out.local = false,
                None => out.flags.push(arg.clone()),
            }
        }
        out
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }

    /// Whether a client path falls under the named files (all when none).
    pub fn selects(&self, local_path: &str) -> bool {
        self.files.is_empty()
            || self.files.iter().any(|f| {
                let f = f.trim_end_matches('/');
                f == "." || local_path == f || local_path.starts_with(&format!("{}/", f))
            })
    }
}

fn local_path(dir: &str, name: &str) -> String {
    if dir == "." {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Accumulates responses and remembers whether anything failed.
#[derive(Default)]
struct Reply {
    responses: Vec<Response>,
    failed: bool,
}

impl Reply {
    fn m(&mut self, line: impl Into<String>) {
        self.responses.push(Response::M(line.into()));
    }

    fn e(&mut self, line: impl Into<String>) {
        self.responses.push(Response::E(line.into()));
    }

    fn fail(&mut self, line: impl Into<String>) {
        self.e(line);
        self.failed = true;
    }

    fn finish(mut self, error: &str) -> Vec<Response> {
        self.responses.push(if self.failed {
            Response::Error(error.to_string())
        } else {
            Response::Ok
        });
        self.responses
    }
}

/// The commands this server implements on top of a [`RevisionStore`].
pub struct DefaultExecutor {
    diff: Box<dyn DiffEngine>,
}

impl Default for DefaultExecutor {
    fn default() -> Self {
        Self::new(Box::new(BinaryDiff))
    }
}

impl DefaultExecutor {
    pub fn new(diff: Box<dyn DiffEngine>) -> Self {
        Self { diff }
    }

    fn send_head(
        &self,
        ctx: &CommandContext<'_>,
        out: &mut Reply,
        dir: &str,
        repo_file: &str,
        name: &str,
        head: &Revision,
        template: Option<&EntryRecord>,
    ) {
        let path = local_path(dir, name);
        if ctx.session.global.noop {
            out.m(format!("U {}", path));
            return;
        }
        let data = match ctx.store.checkout(repo_file, &head.number) {
            Ok(d) => d,
            Err(e) => {
                out.fail(format!("rcvs {}: {}: {}", ctx.name, path, e));
                return;
            }
        };
        let mut entry = EntryRecord::file(name, head.number.as_str(), EntryTimestamp::Other(String::new()));
        if let Some(t) = template {
            entry.keyword_opts = t.keyword_opts.clone();
            entry.tag = t.tag.clone();
        }
        if !ctx.session.global.quiet {
            out.m(format!("U {}", path));
        }
        out.responses.push(Response::File {
            kind: UpdateKind::Updated,
            dir: dir.to_string(),
            repo_path: ctx.repo_path(repo_file),
            entry,
            mode: if ctx.session.global.read_only { 0o444 } else { 0o644 },
            mod_time: Some(head.mtime),
            data,
        });
    }

    /// Send every live file under `repo_dir` into client directory `dir`.
    fn send_tree(&self, ctx: &CommandContext<'_>, out: &mut Reply, args: &CommandArgs, repo_dir: &str, dir: &str) {
        let listing = match ctx.store.list(repo_dir) {
            Ok(l) => l,
            Err(e) => {
                out.fail(format!("rcvs {}: {}: {}", ctx.name, repo_dir, e));
                return;
            }
        };
        let (subdirs, files): (Vec<_>, Vec<_>) = listing.into_iter().partition(|i| i.is_dir);
        for item in files {
            let repo_child = local_path(repo_dir, &item.name);
            let local_child = local_path(dir, &item.name);
            match ctx.store.head(&repo_child) {
                Ok(Some(head)) if !head.dead => {
                    self.send_head(ctx, out, dir, &repo_child, &item.name, &head, None)
                }
                Ok(_) => {}
                Err(e) => out.fail(format!("rcvs {}: {}: {}", ctx.name, local_child, e)),
            }
        }
        if !args.local {
            for sub in subdirs {
                let repo_child = local_path(repo_dir, &sub.name);
                self.send_tree(ctx, out, args, &repo_child, &local_path(dir, &sub.name));
            }
        }
    }

    fn checkout(&self, ctx: &CommandContext<'_>, args: &CommandArgs) -> Vec<Response> {
        let mut out = Reply::default();
        if args.files.is_empty() {
            out.fail("rcvs checkout: must specify at least one module or directory");
        }
        for module in &args.files {
            let module = module.trim_matches('/');
            match ctx.store.list(module) {
                Ok(l) if !l.is_empty() => {
                    if !ctx.session.global.quiet {
                        out.e(format!("rcvs checkout: Updating {}", module));
                    }
                    self.send_tree(ctx, &mut out, args, module, module);
                }
                Ok(_) => out.fail(format!("rcvs checkout: cannot find module `{}' - ignored", module)),
                Err(e) => out.fail(format!("rcvs checkout: {}: {}", module, e)),
            }
        }
        out.finish("")
    }

    fn update(&self, ctx: &CommandContext<'_>, args: &CommandArgs) -> Vec<Response> {
        let mut out = Reply::default();
        for dir in ctx.session.dirs() {
            if args.local && dir.local != "." {
                continue;
            }
            let mut names = dir.names();
            let mut repo_subdirs = Vec::new();
            match ctx.store.list(&dir.repo) {
                Ok(listing) => {
                    for item in listing {
                        if item.is_dir {
                            repo_subdirs.push(item.name);
                        } else {
                            names.insert(item.name);
                        }
                    }
                }
                Err(e) => out.fail(format!("rcvs update: {}: {}", dir.repo, e)),
            }

            for name in names {
                let path = local_path(&dir.local, &name);
                if args.selects(&path) {
                    self.update_file(ctx, &mut out, dir, &name);
                }
            }

            // `-d`: bring in directories the client does not have yet.
            if args.has_flag("-d") && !args.local {
                for sub in repo_subdirs {
                    let local = local_path(&dir.local, &sub);
                    if ctx.session.dir(&local).is_none() && args.selects(&local) {
                        self.send_tree(ctx, &mut out, args, &dir.repo_file(&sub), &local);
                    }
                }
            }
        }
        out.finish("")
    }

    fn update_file(&self, ctx: &CommandContext<'_>, out: &mut Reply, dir: &DirState, name: &str) {
        let path = local_path(&dir.local, name);
        let repo_file = dir.repo_file(name);
        let head = match ctx.store.head(&repo_file) {
            Ok(h) => h,
            Err(e) => {
                out.fail(format!("rcvs update: {}: {}", path, e));
                return;
            }
        };
        let live = head.as_ref().filter(|h| !h.dead);
        let entry = dir.entries().get(name);

        match dir.status(name) {
            FileStatus::Unknown => match (dir.claim(name), live) {
                (None, Some(h)) => self.send_head(ctx, out, &dir.local, &repo_file, name, h, None),
                (Some(_), Some(_)) => out.fail(format!(
                    "rcvs update: move away {}; it is in the way",
                    path
                )),
                (Some(_), None) => out.m(format!("? {}", path)),
                (None, None) => {}
            },
            status @ (FileStatus::UpToDate | FileStatus::Lost) => match live {
                Some(h) => {
                    let stale = entry.map_or(true, |e| e.revision != h.number);
                    if status == FileStatus::Lost {
                        out.e(format!("rcvs update: warning: {} was lost", path));
                    }
                    if stale || status == FileStatus::Lost {
                        self.send_head(ctx, out, &dir.local, &repo_file, name, h, entry);
                    }
                }
                None => {
                    out.e(format!("rcvs update: {} is no longer in the repository", path));
                    if !ctx.session.global.noop {
                        out.responses.push(Response::Removed {
                            dir: dir.local.clone(),
                            repo_path: ctx.repo_path(&repo_file),
                        });
                    }
                }
            },
            FileStatus::Modified => match (live, entry) {
                (Some(h), Some(e)) if h.number == e.revision => out.m(format!("M {}", path)),
                (Some(_), _) => {
                    out.e(format!("rcvs update: {} has been changed in the repository", path));
                    out.m(format!("C {}", path));
                }
                (None, _) => out.e(format!(
                    "rcvs update: conflict: {} is modified but no longer in the repository",
                    path
                )),
            },
            FileStatus::Added => out.m(format!("A {}", path)),
            FileStatus::Removed => out.m(format!("R {}", path)),
            FileStatus::Conflict => out.m(format!("C {}", path)),
        }
    }

    fn commit(&self, ctx: &CommandContext<'_>, args: &CommandArgs) -> Vec<Response> {
        enum Plan<'s> {
            Store { dir: &'s DirState, name: String, data: Bytes, previous: Option<String> },
            Remove { dir: &'s DirState, name: String },
        }

        let mut out = Reply::default();
        let mut plan = Vec::new();
        for dir in ctx.session.dirs() {
            for name in dir.names() {
                let path = local_path(&dir.local, &name);
                if !args.selects(&path) {
                    continue;
                }
                let repo_file = dir.repo_file(&name);
                let head = match ctx.store.head(&repo_file) {
                    Ok(h) => h,
                    Err(e) => {
                        out.fail(format!("rcvs commit: {}: {}", path, e));
                        continue;
                    }
                };
                let entry = dir.entries().get(&name);
                match dir.status(&name) {
                    status @ (FileStatus::Modified | FileStatus::Added) => {
                        let data = match dir.claim(&name) {
                            Some(Claim::Modified { data, .. }) => data.clone(),
                            _ => {
                                out.fail(format!("rcvs commit: {}: contents were not sent", path));
                                continue;
                            }
                        };
                        let live = head.as_ref().filter(|h| !h.dead);
                        if status == FileStatus::Added && live.is_some() {
                            out.fail(format!("rcvs commit: {} already exists in the repository", path));
                            continue;
                        }
                        if status == FileStatus::Modified
                            && live.map(|h| h.number.as_str()) != entry.map(|e| e.revision.as_str())
                        {
                            out.fail(format!("rcvs commit: Up-to-date check failed for `{}'", path));
                            continue;
                        }
                        plan.push(Plan::Store {
                            dir,
                            name,
                            data,
                            previous: live.map(|h| h.number.clone()),
                        });
                    }
                    FileStatus::Removed => plan.push(Plan::Remove { dir, name }),
                    FileStatus::Conflict => out.fail(format!(
                        "rcvs commit: file `{}' had a conflict and has not been modified",
                        path
                    )),
                    _ => {}
                }
            }
        }

        if out.failed {
            return out.finish("correct above errors first!");
        }
        if plan.is_empty() {
            return out.finish("");
        }

        let message = args.message.clone().unwrap_or_default();
        for item in plan {
            match item {
                Plan::Store { dir, name, data, previous } => {
                    let path = local_path(&dir.local, &name);
                    let repo_file = dir.repo_file(&name);
                    if ctx.session.global.noop {
                        out.m(format!("Would check in {}", path));
                        continue;
                    }
                    match ctx.store.commit(&repo_file, &data, &message, ctx.user) {
                        Ok(rev) => {
                            out.m(format!("{},v  <--  {}", ctx.repo_path(&repo_file), path));
                            match previous {
                                Some(p) => out.m(format!("new revision: {}; previous revision: {}", rev, p)),
                                None => out.m(format!("initial revision: {}", rev)),
                            }
                            let mut entry = EntryRecord::file(name.as_str(), rev, EntryTimestamp::Other(String::new()));
                            if let Some(e) = dir.entries().get(&name) {
                                entry.keyword_opts = e.keyword_opts.clone();
                                entry.tag = e.tag.clone();
                            }
                            out.responses.push(Response::CheckedIn {
                                dir: dir.local.clone(),
                                repo_path: ctx.repo_path(&repo_file),
                                entry,
                            });
                        }
                        Err(e) => out.fail(format!("rcvs commit: {}: {}", path, e)),
                    }
                }
                Plan::Remove { dir, name } => {
                    let path = local_path(&dir.local, &name);
                    let repo_file = dir.repo_file(&name);
                    if ctx.session.global.noop {
                        out.m(format!("Would remove {}", path));
                        continue;
                    }
                    match ctx.store.remove(&repo_file, &message) {
                        Ok(rev) => {
                            out.m(format!("Removing {};", path));
                            out.m(format!("new revision: delete; previous revision: {}", rev));
                            out.responses.push(Response::RemoveEntry {
                                dir: dir.local.clone(),
                                repo_path: ctx.repo_path(&repo_file),
                            });
                        }
                        Err(e) => out.fail(format!("rcvs commit: {}: {}", path, e)),
                    }
                }
            }
        }
        out.finish("")
    }

    fn add(&self, ctx: &CommandContext<'_>, args: &CommandArgs) -> Vec<Response> {
        let mut out = Reply::default();
        if args.files.is_empty() {
            out.fail("rcvs add: nothing to add");
        }
        let mut scheduled = 0;
        for arg in &args.files {
            let arg = arg.trim_end_matches('/');

            if let Some(newdir) = ctx.session.dir(arg).filter(|_| arg != ".") {
                let repo = ctx.repo_path(&newdir.repo);
                if ctx.session.global.noop {
                    out.m(format!("Would add directory {}", repo));
                    continue;
                }
                match ctx.store.create_dir(&newdir.repo) {
                    Ok(true) => out.m(format!("Directory {} added to the repository", repo)),
                    Ok(false) => out.e(format!("rcvs add: {} already exists", repo)),
                    Err(e) => out.fail(format!("rcvs add: {}: {}", arg, e)),
                }
                continue;
            }

            let (dir_local, name) = arg.rsplit_once('/').unwrap_or((".", arg));
            let Some(dir) = ctx.session.dir(dir_local) else {
                out.fail(format!("rcvs add: cannot add {}: directory was not sent", arg));
                continue;
            };
            let repo_file = dir.repo_file(name);
            let entry = dir.entries().get(name);

            if let Some(e) = entry {
                if let Some(rev) = e.revision.strip_prefix('-') {
                    let mut back = e.clone();
                    back.revision = rev.to_string();
                    back.checkout_timestamp = EntryTimestamp::Dummy;
                    out.e(format!("rcvs add: {}, version {}, resurrected", arg, rev));
                    out.responses.push(Response::CheckedIn {
                        dir: dir.local.clone(),
                        repo_path: ctx.repo_path(&repo_file),
                        entry: back,
                    });
                } else {
                    out.e(format!("rcvs add: {} has already been entered", arg));
                }
                continue;
            }

            match ctx.store.head(&repo_file) {
                Ok(Some(h)) if !h.dead => {
                    out.fail(format!("rcvs add: {} already exists, with version number {}", arg, h.number));
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    out.fail(format!("rcvs add: {}: {}", arg, e));
                    continue;
                }
            }
            if dir.claim(name).is_none() {
                out.fail(format!("rcvs add: nothing known about {}", arg));
                continue;
            }
            let mut new_entry = EntryRecord::file(name, crate::entries::ADDED_REVISION, EntryTimestamp::Initial(name.to_string()));
            if let Some(k) = &args.kopt {
                new_entry.keyword_opts = format!("-k{}", k);
            }
            out.e(format!("rcvs add: scheduling file `{}' for addition", arg));
            out.responses.push(Response::CheckedIn {
                dir: dir.local.clone(),
                repo_path: ctx.repo_path(&repo_file),
                entry: new_entry,
            });
            scheduled += 1;
        }
        if scheduled > 0 {
            let what = if scheduled == 1 { "this file" } else { "these files" };
            out.e(format!("rcvs add: use `rcvs commit' to add {} permanently", what));
        }
        out.finish("")
    }

    fn remove(&self, ctx: &CommandContext<'_>, args: &CommandArgs) -> Vec<Response> {
        let mut out = Reply::default();
        let explicit = !args.files.is_empty();
        let mut scheduled = 0;
        for dir in ctx.session.dirs() {
            for name in dir.names() {
                let path = local_path(&dir.local, &name);
                if !args.selects(&path) {
                    continue;
                }
                let Some(entry) = dir.entries().get(&name) else {
                    if explicit {
                        out.e(format!("rcvs remove: nothing known about `{}'", path));
                    }
                    continue;
                };
                let repo_path = ctx.repo_path(&dir.repo_file(&name));
                match dir.status(&name) {
                    FileStatus::Lost => {
                        let mut gone = entry.clone();
                        gone.revision = format!("-{}", entry.revision);
                        gone.checkout_timestamp = EntryTimestamp::Dummy;
                        out.e(format!("rcvs remove: scheduling `{}' for removal", path));
                        out.responses.push(Response::CheckedIn {
                            dir: dir.local.clone(),
                            repo_path,
                            entry: gone,
                        });
                        scheduled += 1;
                    }
                    FileStatus::Added => {
                        out.e(format!("rcvs remove: removed `{}'", path));
                        out.responses.push(Response::RemoveEntry {
                            dir: dir.local.clone(),
                            repo_path,
                        });
                    }
                    FileStatus::Removed => {
                        out.e(format!("rcvs remove: file `{}' already scheduled for removal", path))
                    }
                    _ if explicit => out.fail(format!(
                        "rcvs remove: file `{}' still in working directory",
                        path
                    )),
                    _ => {}
                }
            }
        }
        if scheduled > 0 {
            out.e("rcvs remove: use `rcvs commit' to remove files permanently");
        }
        out.finish("")
    }

    fn status(&self, ctx: &CommandContext<'_>, args: &CommandArgs) -> Vec<Response> {
        let mut out = Reply::default();
        for dir in ctx.session.dirs() {
            for name in dir.names() {
                let path = local_path(&dir.local, &name);
                if !args.selects(&path) {
                    continue;
                }
                let status = dir.status(&name);
                if status == FileStatus::Unknown {
                    out.m(format!("? {}", path));
                    continue;
                }
                let repo_file = dir.repo_file(&name);
                let head = ctx.store.head(&repo_file).ok().flatten();
                let entry = dir.entries().get(&name);
                let word = match (status, &head, entry) {
                    (FileStatus::UpToDate, Some(h), Some(e)) if h.number != e.revision => "Needs Patch",
                    (s, _, _) => s.describe(),
                };

                out.m("===================================================================");
                out.m(format!("File: {:<16} Status: {}", name, word));
                out.m("");
                out.m(match entry {
                    Some(e) => format!("   Working revision:\t{}", e.revision),
                    None => format!("   Working revision:\tNo entry for {}", name),
                });
                out.m(match &head {
                    Some(h) => format!("   Repository revision:\t{}\t{},v", h.number, ctx.repo_path(&repo_file)),
                    None => "   Repository revision:\tNo revision control file".to_string(),
                });
                if let Some(tag) = entry.and_then(|e| e.sticky_tag()) {
                    out.m(format!("   Sticky Tag:\t\t{}", tag));
                }
                out.m("");
            }
        }
        out.finish("")
    }

    fn diff(&self, ctx: &CommandContext<'_>, args: &CommandArgs) -> Vec<Response> {
        let mut out = Reply::default();
        for dir in ctx.session.dirs() {
            for name in dir.names() {
                let path = local_path(&dir.local, &name);
                if !args.selects(&path) {
                    continue;
                }
                let status = dir.status(&name);
                if status == FileStatus::Unknown {
                    out.m(format!("? {}", path));
                    continue;
                }
                let repo_file = dir.repo_file(&name);
                let entry = dir.entries().get(&name);
                let new: &[u8] = match dir.claim(&name) {
                    Some(Claim::Modified { data, .. }) => &data[..],
                    _ if status == FileStatus::Removed => &[],
                    _ => continue,
                };
                let base_rev = entry.map(|e| e.revision.trim_start_matches('-').to_string());
                let old = match base_rev.as_deref() {
                    Some(rev) if status != FileStatus::Added => {
                        match ctx.store.checkout(&repo_file, args.revision.as_deref().unwrap_or(rev)) {
                            Ok(d) => d,
                            Err(e) => {
                                out.fail(format!("rcvs diff: {}: {}", path, e));
                                continue;
                            }
                        }
                    }
                    _ => Bytes::new(),
                };
                let body = self.diff.diff(&path, &old, new);
                if body.is_empty() {
                    continue;
                }
                out.m(format!("Index: {}", path));
                out.m("===================================================================");
                out.m(format!("RCS file: {},v", ctx.repo_path(&repo_file)));
                if let Some(rev) = base_rev.filter(|_| status != FileStatus::Added) {
                    out.m(format!("retrieving revision {}", args.revision.clone().unwrap_or(rev)));
                }
                for line in body {
                    out.m(line);
                }
            }
        }
        out.finish("")
    }
}

impl CommandExecutor for DefaultExecutor {
    fn execute(&self, ctx: &CommandContext<'_>) -> Vec<Response> {
        let args = CommandArgs::parse(&ctx.session.args);
        tracing::debug!("Executing {} {:?}", ctx.name, args);
        match ctx.name {
            "update" => self.update(ctx, &args),
            "checkout" | "co" => self.checkout(ctx, &args),
            "commit" | "ci" => self.commit(ctx, &args),
            "add" => self.add(ctx, &args),
            "remove" => self.remove(ctx, &args),
            "status" => self.status(ctx, &args),
            "diff" => self.diff(ctx, &args),
            "expand-modules" => vec![Response::Ok],
            other => vec![Response::Error(format!("{} not supported by this server", other))],
        }
    }
}

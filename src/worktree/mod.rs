//! In-memory model of a working-copy subtree.
//!
//! Nodes live in an arena owned by [`WorkingTree`]; a node owns its children
//! through their ids, and `parent` is a non-owning back-reference used only to
//! rebuild paths. Each file carries a reconciliation status derived from the
//! filesystem and the directory's Entries.

pub mod ignore;

pub use ignore::IgnoreSet;

use crate::entries::{Entries, EntryKind, EntryRecord, EntryTimestamp, OpenMode, ADMIN_DIR};
use crate::error::{CvsError, Result};
use crate::timestamp;
use std::collections::HashSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    File,
    Dir,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Unknown,
    UpToDate,
    Modified,
    Added,
    Removed,
    Conflict,
    Lost,
}

impl FileStatus {
    /// One-letter code used in update output.
    pub fn code(&self) -> char {
        match self {
            FileStatus::Unknown => '?',
            FileStatus::UpToDate => 'U',
            FileStatus::Modified => 'M',
            FileStatus::Added => 'A',
            FileStatus::Removed => 'R',
            FileStatus::Conflict => 'C',
            FileStatus::Lost => '!',
        }
    }

    pub fn describe(&self) -> &'static str {
        match self {
            FileStatus::Unknown => "Unknown",
            FileStatus::UpToDate => "Up-to-date",
            FileStatus::Modified => "Locally Modified",
            FileStatus::Added => "Locally Added",
            FileStatus::Removed => "Locally Removed",
            FileStatus::Conflict => "Unresolved Conflict",
            FileStatus::Lost => "Needs Checkout",
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkingNode {
    pub name: String,
    pub kind: NodeKind,
    pub status: FileStatus,
    pub mode: u32,
    pub mtime: Option<i64>,
    pub last_revision: Option<String>,
    pub sticky_tag: Option<String>,
    pub keyword_mode: String,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
}

impl WorkingNode {
    fn new(name: &str, kind: NodeKind, parent: Option<NodeId>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            status: FileStatus::Unknown,
            mode: if kind == NodeKind::Dir { 0o755 } else { 0o644 },
            mtime: None,
            last_revision: None,
            sticky_tag: None,
            keyword_mode: String::new(),
            parent,
            children: Vec::new(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == NodeKind::Dir
    }

    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Copy revision, tag and keyword mode from an entry.
    pub fn apply_entry(&mut self, entry: &EntryRecord) {
        self.last_revision = Some(entry.revision.clone());
        self.sticky_tag = entry.sticky_tag().map(str::to_string);
        self.keyword_mode = entry.keyword_opts.clone();
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ScanFlags: u8 {
        const RECURSE = 1 << 0;
        const APPLY_IGNORE = 1 << 1;
        const SORT_BY_NAME = 1 << 2;
        const ONLY_KNOWN_DIRS = 1 << 3;
    }
}

impl Default for ScanFlags {
    fn default() -> Self {
        ScanFlags::RECURSE | ScanFlags::APPLY_IGNORE | ScanFlags::SORT_BY_NAME
    }
}

#[derive(Debug, Clone, Default)]
pub struct ScanOptions {
    pub flags: ScanFlags,
    pub ignore: IgnoreSet,
}

impl ScanOptions {
    pub fn new(flags: ScanFlags) -> Self {
        let ignore = if flags.contains(ScanFlags::APPLY_IGNORE) {
            IgnoreSet::for_user()
        } else {
            IgnoreSet::empty()
        };
        Self { flags, ignore }
    }

    pub fn with_ignore(mut self, ignore: IgnoreSet) -> Self {
        self.ignore = ignore;
        self
    }
}

/// Derive a file's status from its entry and what is on disk.
///
/// `mtime` is `None` when the file does not exist.
pub fn classify(entry: Option<&EntryRecord>, mtime: Option<i64>) -> FileStatus {
    let entry = match entry {
        None => return FileStatus::Unknown,
        Some(e) => e,
    };
    if entry.is_added() {
        return FileStatus::Added;
    }
    if entry.is_removed() {
        return FileStatus::Removed;
    }
    let mtime = match mtime {
        None => return FileStatus::Lost,
        Some(t) => t,
    };
    if let Some(ref conflict) = entry.conflict_timestamp {
        return match timestamp::parse_entry_time(conflict) {
            Some(t) if t != mtime => FileStatus::Modified,
            _ => FileStatus::Conflict,
        };
    }
    match entry.checkout_timestamp {
        EntryTimestamp::At(t) if t == mtime => FileStatus::UpToDate,
        EntryTimestamp::Unchanged => FileStatus::UpToDate,
        _ => FileStatus::Modified,
    }
}

/// A scanned (or assembled) working-copy subtree.
#[derive(Debug, Clone)]
pub struct WorkingTree {
    base: PathBuf,
    nodes: Vec<WorkingNode>,
}

impl WorkingTree {
    /// A tree holding only a root directory at `base`.
    pub fn new(base: &Path) -> Self {
        let mut root = WorkingNode::new(".", NodeKind::Dir, None);
        root.status = FileStatus::UpToDate;
        Self {
            base: base.to_path_buf(),
            nodes: vec![root],
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn root(&self) -> NodeId {
        NodeId(0)
    }

    pub fn node(&self, id: NodeId) -> &WorkingNode {
        &self.nodes[id.0]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut WorkingNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub fn child(&self, parent: NodeId, name: &str) -> Option<NodeId> {
        self.nodes[parent.0]
            .children
            .iter()
            .copied()
            .find(|&c| self.nodes[c.0].name == name)
    }

    fn push(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(WorkingNode::new(name, kind, Some(parent)));
        self.nodes[parent.0].children.push(id);
        id
    }

    /// Return the named child, creating it with `kind` if absent.
    pub fn ensure_child(&mut self, parent: NodeId, name: &str, kind: NodeKind) -> NodeId {
        match self.child(parent, name) {
            Some(id) => id,
            None => self.push(parent, name, kind),
        }
    }

    /// Walk (and create) directory nodes along a `/`-separated relative path.
    pub fn ensure_dir_path(&mut self, rel: &str) -> NodeId {
        let mut cur = self.root();
        for seg in rel.split('/').filter(|s| !s.is_empty() && *s != ".") {
            cur = self.ensure_child(cur, seg, NodeKind::Dir);
            if self.nodes[cur.0].status == FileStatus::Unknown {
                self.nodes[cur.0].status = FileStatus::UpToDate;
            }
        }
        cur
    }

    /// Path of a node relative to the tree base (`.` for the root).
    pub fn path(&self, id: NodeId) -> PathBuf {
        let mut segs = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            let node = &self.nodes[c.0];
            if node.parent.is_some() {
                segs.push(node.name.as_str());
            }
            cur = node.parent;
        }
        if segs.is_empty() {
            return PathBuf::from(".");
        }
        segs.iter().rev().collect()
    }

    pub fn full_path(&self, id: NodeId) -> PathBuf {
        if id == self.root() {
            self.base.clone()
        } else {
            self.base.join(self.path(id))
        }
    }

    /// Remove a node from its parent's child list. The arena slot stays but
    /// becomes unreachable.
    pub fn detach(&mut self, id: NodeId) {
        if let Some(parent) = self.nodes[id.0].parent {
            self.nodes[parent.0].children.retain(|&c| c != id);
        }
    }

    fn sort_children(&mut self, id: NodeId) {
        let mut children = std::mem::take(&mut self.nodes[id.0].children);
        children.sort_by(|a, b| self.nodes[a.0].name.cmp(&self.nodes[b.0].name));
        self.nodes[id.0].children = children;
    }

    /// Pre-order traversal starting at `id`. The first error from `visitor`
    /// stops the walk and is returned.
    pub fn visit<E, F>(&self, id: NodeId, visitor: &mut F) -> std::result::Result<(), E>
    where
        F: FnMut(&WorkingTree, NodeId) -> std::result::Result<(), E>,
    {
        visitor(self, id)?;
        for &child in &self.nodes[id.0].children {
            self.visit(child, visitor)?;
        }
        Ok(())
    }

    /// Post-order traversal: children before their directory.
    pub fn visit_post<E, F>(&self, id: NodeId, visitor: &mut F) -> std::result::Result<(), E>
    where
        F: FnMut(&WorkingTree, NodeId) -> std::result::Result<(), E>,
    {
        for &child in &self.nodes[id.0].children {
            self.visit_post(child, visitor)?;
        }
        visitor(self, id)
    }

    /// All reachable file nodes, pre-order.
    pub fn files(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let _ = self.visit::<(), _>(self.root(), &mut |tree, id| {
            if !tree.node(id).is_dir() {
                out.push(id);
            }
            Ok(())
        });
        out
    }

    /// All reachable directory nodes, pre-order, root first.
    pub fn dirs(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let _ = self.visit::<(), _>(self.root(), &mut |tree, id| {
            if tree.node(id).is_dir() {
                out.push(id);
            }
            Ok(())
        });
        out
    }
}

/// Scan `path` into a [`WorkingTree`].
///
/// A directory is walked (recursively with `RECURSE`); a single file is
/// scanned as the only child of its parent directory.
pub fn scan(path: &Path, options: &ScanOptions) -> Result<WorkingTree> {
    match fs::metadata(path) {
        Ok(meta) if meta.is_dir() => {
            let mut tree = WorkingTree::new(path);
            let root = tree.root();
            let ignore = options.ignore.for_dir(path);
            scan_dir(&mut tree, root, path, &ignore, options)?;
            Ok(tree)
        }
        Ok(_) | Err(_) => scan_single(path, options),
    }
}

fn scan_single(path: &Path, options: &ScanOptions) -> Result<WorkingTree> {
    let parent = match path.parent() {
        Some(p) if p.as_os_str().is_empty() => Path::new("."),
        Some(p) => p,
        None => return Err(CvsError::NotADirectory(path.to_path_buf())),
    };
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| CvsError::NotFound(path.display().to_string()))?;

    match fs::metadata(parent) {
        Ok(meta) if meta.is_dir() => {}
        _ => return Err(CvsError::NotADirectory(parent.to_path_buf())),
    }

    let entries = Entries::open(parent, OpenMode::Read)?;
    let mtime = fs::metadata(path).ok().map(|m| timestamp::mtime_secs(&m));
    let entry = entries.get(name);
    if entry.is_none() && mtime.is_none() {
        return Err(CvsError::NotFound(path.display().to_string()));
    }
    if entry.is_none() && options.flags.contains(ScanFlags::APPLY_IGNORE) && options.ignore.is_ignored(name) {
        return Ok(WorkingTree::new(parent));
    }

    let mut tree = WorkingTree::new(parent);
    let root = tree.root();
    let id = tree.ensure_child(root, name, NodeKind::File);
    fill_file(&mut tree, id, entry, path, mtime);
    Ok(tree)
}

fn fill_file(
    tree: &mut WorkingTree,
    id: NodeId,
    entry: Option<&EntryRecord>,
    path: &Path,
    mtime: Option<i64>,
) {
    let node = tree.node_mut(id);
    node.status = classify(entry, mtime);
    node.mtime = mtime;
    if let Some(e) = entry {
        node.apply_entry(e);
    }
    #[cfg(unix)]
    if mtime.is_some() {
        use std::os::unix::fs::PermissionsExt;
        if let Ok(meta) = fs::metadata(path) {
            node.mode = meta.permissions().mode() & 0o7777;
        }
    }
    #[cfg(not(unix))]
    let _ = path;
}

fn scan_dir(
    tree: &mut WorkingTree,
    dir_id: NodeId,
    dir: &Path,
    ignore: &IgnoreSet,
    options: &ScanOptions,
) -> Result<()> {
    let entries = match Entries::open(dir, OpenMode::Read) {
        Ok(e) => e,
        Err(CvsError::IoAt { path, source }) if source.kind() == io::ErrorKind::PermissionDenied => {
            tracing::warn!("Skipping unreadable {}", path.display());
            return Ok(());
        }
        Err(e) => return Err(e),
    };
    if let Some(tag) = crate::admin::read_tag(dir).ok().flatten() {
        tree.node_mut(dir_id).sticky_tag = Some(tag.get(1..).unwrap_or_default().to_string());
    }

    let read_dir = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
            tracing::warn!("Skipping unreadable directory {}", dir.display());
            return Ok(());
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            return Err(CvsError::NotADirectory(dir.to_path_buf()))
        }
        Err(e) => return Err(CvsError::io_at(dir, e)),
    };

    let apply_ignore = options.flags.contains(ScanFlags::APPLY_IGNORE);
    let mut seen = HashSet::new();
    let mut subdirs = Vec::new();

    for dirent in read_dir {
        let dirent = match dirent {
            Ok(d) => d,
            Err(e) => {
                tracing::warn!("Error reading {}: {}", dir.display(), e);
                continue;
            }
        };
        let name = match dirent.file_name().into_string() {
            Ok(n) => n,
            Err(raw) => {
                tracing::warn!("Skipping non-UTF-8 name {:?} in {}", raw, dir.display());
                continue;
            }
        };
        if name == ADMIN_DIR {
            continue;
        }
        let path = dirent.path();
        let meta = match fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                // Dangling symlink or a race with deletion: treat as absent.
                tracing::debug!("Cannot stat {}: {}", path.display(), e);
                continue;
            }
        };
        let entry = entries.get(&name);

        if meta.is_dir() {
            let known = matches!(entry, Some(e) if e.kind == EntryKind::Dir)
                || path.join(ADMIN_DIR).is_dir();
            if !known && options.flags.contains(ScanFlags::ONLY_KNOWN_DIRS) {
                continue;
            }
            if !known && apply_ignore && ignore.is_ignored(&name) {
                continue;
            }
            seen.insert(name.clone());
            let id = tree.ensure_child(dir_id, &name, NodeKind::Dir);
            let node = tree.node_mut(id);
            node.status = if known {
                FileStatus::UpToDate
            } else {
                FileStatus::Unknown
            };
            node.mtime = Some(timestamp::mtime_secs(&meta));
            if known && options.flags.contains(ScanFlags::RECURSE) {
                subdirs.push((id, path));
            }
        } else {
            if entry.is_none() && apply_ignore && ignore.is_ignored(&name) {
                continue;
            }
            seen.insert(name.clone());
            let id = tree.ensure_child(dir_id, &name, NodeKind::File);
            let mtime = Some(timestamp::mtime_secs(&meta));
            fill_file(tree, id, entry, &path, mtime);
        }
    }

    // Entries with nothing on disk.
    for entry in entries.iter() {
        if entry.kind != EntryKind::File || seen.contains(&entry.name) {
            continue;
        }
        let id = tree.ensure_child(dir_id, &entry.name, NodeKind::File);
        fill_file(tree, id, Some(entry), &dir.join(&entry.name), None);
    }
    entries.close()?;

    if options.flags.contains(ScanFlags::SORT_BY_NAME) {
        tree.sort_children(dir_id);
    }

    for (id, path) in subdirs {
        let child_ignore = if apply_ignore {
            ignore.for_dir(&path)
        } else {
            IgnoreSet::empty()
        };
        match scan_dir(tree, id, &path, &child_ignore, options) {
            Ok(()) => {}
            Err(CvsError::IoAt { path, source })
                if source.kind() == io::ErrorKind::PermissionDenied =>
            {
                tracing::warn!("Skipping unreadable {}", path.display());
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entries::{Entries, EntryRecord, OpenMode};
    use std::fs;
    use tempfile::TempDir;

    fn checkout(dir: &Path, name: &str, contents: &str, rev: &str) {
        let path = dir.join(name);
        fs::write(&path, contents).unwrap();
        let mtime = timestamp::mtime_secs(&fs::metadata(&path).unwrap());
        let mut e = Entries::open(dir, OpenMode::Write).unwrap();
        e.add(EntryRecord::file(name, rev, EntryTimestamp::At(mtime)));
        e.close().unwrap();
    }

    fn status_of(tree: &WorkingTree, name: &str) -> FileStatus {
        let id = tree.child(tree.root(), name).unwrap();
        tree.node(id).status
    }

    #[test]
    fn test_classify_rules() {
        let at = |t| EntryRecord::file("f", "1.1", EntryTimestamp::At(t));
        assert_eq!(classify(None, Some(5)), FileStatus::Unknown);
        assert_eq!(classify(Some(&at(5)), Some(5)), FileStatus::UpToDate);
        assert_eq!(classify(Some(&at(5)), Some(6)), FileStatus::Modified);
        assert_eq!(classify(Some(&at(5)), None), FileStatus::Lost);
        let added = EntryRecord::file("f", "0", EntryTimestamp::Initial("f".into()));
        assert_eq!(classify(Some(&added), Some(1)), FileStatus::Added);
        let removed = EntryRecord::file("f", "-1.1", EntryTimestamp::Dummy);
        assert_eq!(classify(Some(&removed), None), FileStatus::Removed);
        let mut conflict = at(5);
        conflict.conflict_timestamp = Some(timestamp::format_entry_time(7));
        assert_eq!(classify(Some(&conflict), Some(7)), FileStatus::Conflict);
        assert_eq!(classify(Some(&conflict), Some(8)), FileStatus::Modified);
    }

    #[test]
    fn test_scan_statuses() {
        let tmp = TempDir::new().unwrap();
        let dir = tmp.path();
        checkout(dir, "same.c", "x", "1.1");
        checkout(dir, "gone.c", "x", "1.1");
        fs::remove_file(dir.join("gone.c")).unwrap();
        fs::write(dir.join("new.c"), "n").unwrap();
        fs::write(dir.join("junk.o"), "o").unwrap();

        checkout(dir, "edited.c", "x", "1.1");
        let t = filetime::FileTime::from_unix_time(1_000_000, 0);
        filetime::set_file_mtime(dir.join("edited.c"), t).unwrap();

        let opts = ScanOptions::default().with_ignore(IgnoreSet::with_defaults());
        let tree = scan(dir, &opts).unwrap();

        assert_eq!(status_of(&tree, "same.c"), FileStatus::UpToDate);
        assert_eq!(status_of(&tree, "gone.c"), FileStatus::Lost);
        assert_eq!(status_of(&tree, "new.c"), FileStatus::Unknown);
        assert_eq!(status_of(&tree, "edited.c"), FileStatus::Modified);
        assert!(tree.child(tree.root(), "junk.o").is_none());
        assert!(tree.child(tree.root(), "CVS").is_none());

        let names: Vec<_> = tree
            .node(tree.root())
            .children()
            .iter()
            .map(|&c| tree.node(c).name.clone())
            .collect();
        let mut sorted = names.clone();
        sorted.sort();
        assert_eq!(names, sorted);
    }

    #[test]
    fn test_scan_recurse_and_paths() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("sub");
        fs::create_dir_all(sub.join("CVS")).unwrap();
        checkout(&sub, "a.txt", "a", "1.2");
        fs::create_dir(tmp.path().join("stray")).unwrap();

        let mut opts = ScanOptions::new(ScanFlags::RECURSE | ScanFlags::SORT_BY_NAME);
        opts.ignore = IgnoreSet::empty();
        let tree = scan(tmp.path(), &opts).unwrap();

        let sub_id = tree.child(tree.root(), "sub").unwrap();
        assert_eq!(tree.node(sub_id).status, FileStatus::UpToDate);
        let a = tree.child(sub_id, "a.txt").unwrap();
        assert_eq!(tree.path(a), PathBuf::from("sub/a.txt"));
        assert_eq!(tree.node(a).last_revision.as_deref(), Some("1.2"));
        assert_eq!(tree.node(a).status, FileStatus::UpToDate);

        let stray = tree.child(tree.root(), "stray").unwrap();
        assert_eq!(tree.node(stray).status, FileStatus::Unknown);

        let opts = ScanOptions::new(ScanFlags::RECURSE | ScanFlags::ONLY_KNOWN_DIRS);
        let tree = scan(tmp.path(), &opts).unwrap();
        assert!(tree.child(tree.root(), "stray").is_none());
    }

    #[test]
    fn test_no_recurse() {
        let tmp = TempDir::new().unwrap();
        let sub = tmp.path().join("sub");
        fs::create_dir_all(&sub).unwrap();
        checkout(&sub, "a.txt", "a", "1.1");
        let tree = scan(tmp.path(), &ScanOptions::new(ScanFlags::SORT_BY_NAME)).unwrap();
        let sub_id = tree.child(tree.root(), "sub").unwrap();
        assert!(tree.node(sub_id).children().is_empty());
    }

    #[test]
    fn test_scan_single_file() {
        let tmp = TempDir::new().unwrap();
        checkout(tmp.path(), "one.c", "1", "1.1");
        let tree = scan(&tmp.path().join("one.c"), &ScanOptions::default()).unwrap();
        assert_eq!(tree.files().len(), 1);
        assert!(scan(&tmp.path().join("nope.c"), &ScanOptions::default()).is_err());
    }

    #[test]
    fn test_scan_not_a_directory() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join("file"), "x").unwrap();
        let err = scan(&tmp.path().join("file/inner"), &ScanOptions::default()).unwrap_err();
        assert!(matches!(err, CvsError::NotADirectory(_)));
    }

    #[test]
    fn test_visit_short_circuits() {
        let mut tree = WorkingTree::new(Path::new("/w"));
        let d = tree.ensure_dir_path("a/b");
        tree.ensure_child(d, "f1", NodeKind::File);
        tree.ensure_child(d, "f2", NodeKind::File);

        let mut visited = Vec::new();
        let result: std::result::Result<(), String> = tree.visit(tree.root(), &mut |t, id| {
            visited.push(t.node(id).name.clone());
            if t.node(id).name == "f1" {
                return Err("stop".into());
            }
            Ok(())
        });
        assert_eq!(result, Err("stop".to_string()));
        assert_eq!(visited, vec![".", "a", "b", "f1"]);

        let mut order = Vec::new();
        tree.visit_post::<(), _>(tree.root(), &mut |t, id| {
            order.push(t.node(id).name.clone());
            Ok(())
        })
        .unwrap();
        assert_eq!(order, vec!["f1", "f2", "b", "a", "."]);
    }

    #[test]
    fn test_detach() {
        let mut tree = WorkingTree::new(Path::new("/w"));
        let f = tree.ensure_child(tree.root(), "f", NodeKind::File);
        assert_eq!(tree.files().len(), 1);
        tree.detach(f);
        assert!(tree.files().is_empty());
        assert_eq!(tree.full_path(f), PathBuf::from("/w/f"));
    }
}

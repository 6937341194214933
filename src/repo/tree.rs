//! Server-side mirror of the repository directory tree.
//!
//! Built once by a recursive walk; afterwards read-mostly. Nodes are held in
//! an arena; `parent` is a non-owning index used for `..` and for rebuilding
//! paths.

use super::lock::LockState;
use crate::error::{CvsError, Result};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

pub const RCS_SUFFIX: &str = ",v";
pub const ATTIC: &str = "Attic";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RepoNodeId(pub(crate) usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepoKind {
    Dir,
    RcsFile,
}

#[derive(Debug)]
pub struct RepoNode {
    /// Name without the `,v` suffix for RCS files.
    pub name: String,
    pub kind: RepoKind,
    parent: Option<RepoNodeId>,
    children: Vec<RepoNodeId>,
    pub(crate) lock: LockState,
}

impl RepoNode {
    fn new(name: &str, kind: RepoKind, parent: Option<RepoNodeId>) -> Self {
        Self {
            name: name.to_string(),
            kind,
            parent,
            children: Vec::new(),
            lock: LockState::default(),
        }
    }

    pub fn is_dir(&self) -> bool {
        self.kind == RepoKind::Dir
    }

    pub fn parent(&self) -> Option<RepoNodeId> {
        self.parent
    }

    pub fn children(&self) -> &[RepoNodeId] {
        &self.children
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LoadOptions {
    /// Validate ownership/modes and log deviations.
    pub check_permissions: bool,
}

#[derive(Debug)]
pub struct RepoTree {
    base: PathBuf,
    nodes: Vec<RepoNode>,
}

impl RepoTree {
    /// An empty tree rooted at `base` (nothing read from disk).
    pub fn empty(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
            nodes: vec![RepoNode::new(".", RepoKind::Dir, None)],
        }
    }

    /// Mirror the on-disk tree under `base`.
    pub fn load(base: &Path, options: LoadOptions) -> Result<Self> {
        let meta = fs::metadata(base).map_err(|e| CvsError::io_at(base, e))?;
        if !meta.is_dir() {
            return Err(CvsError::NotADirectory(base.to_path_buf()));
        }
        let mut tree = Self::empty(base);
        if options.check_permissions {
            check_mode(base, &meta, RepoKind::Dir);
        }
        tree.load_dir(RepoNodeId(0), base, options)?;
        tracing::info!(
            "Loaded repository {} ({} nodes)",
            base.display(),
            tree.nodes.len()
        );
        Ok(tree)
    }

    fn load_dir(&mut self, id: RepoNodeId, dir: &Path, options: LoadOptions) -> Result<()> {
        let read_dir = match fs::read_dir(dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                tracing::warn!("Skipping unreadable repository directory {}", dir.display());
                return Ok(());
            }
            Err(e) => return Err(CvsError::io_at(dir, e)),
        };

        let mut subdirs = Vec::new();
        for dirent in read_dir {
            let dirent = dirent.map_err(|e| CvsError::io_at(dir, e))?;
            let name = match dirent.file_name().into_string() {
                Ok(n) => n,
                Err(_) => continue,
            };
            let path = dirent.path();
            let meta = match fs::metadata(&path) {
                Ok(m) => m,
                Err(e) => {
                    tracing::debug!("Cannot stat {}: {}", path.display(), e);
                    continue;
                }
            };

            if meta.is_dir() {
                if options.check_permissions {
                    check_mode(&path, &meta, RepoKind::Dir);
                }
                let child = self.insert(id, &name, RepoKind::Dir);
                subdirs.push((child, path));
            } else if let Some(stem) = name.strip_suffix(RCS_SUFFIX) {
                if stem.is_empty() {
                    continue;
                }
                if options.check_permissions {
                    check_mode(&path, &meta, RepoKind::RcsFile);
                }
                self.insert(id, stem, RepoKind::RcsFile);
            }
        }

        for (child, path) in subdirs {
            self.load_dir(child, &path, options)?;
        }
        let mut children = std::mem::take(&mut self.nodes[id.0].children);
        children.sort_by(|a, b| self.nodes[a.0].name.cmp(&self.nodes[b.0].name));
        self.nodes[id.0].children = children;
        Ok(())
    }

    fn insert(&mut self, parent: RepoNodeId, name: &str, kind: RepoKind) -> RepoNodeId {
        let id = RepoNodeId(self.nodes.len());
        self.nodes.push(RepoNode::new(name, kind, Some(parent)));
        self.nodes[parent.0].children.push(id);
        id
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn root(&self) -> RepoNodeId {
        RepoNodeId(0)
    }

    pub fn node(&self, id: RepoNodeId) -> &RepoNode {
        &self.nodes[id.0]
    }

    pub(crate) fn node_mut(&mut self, id: RepoNodeId) -> &mut RepoNode {
        &mut self.nodes[id.0]
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.len() == 1
    }

    pub(crate) fn ids(&self) -> impl Iterator<Item = RepoNodeId> {
        (0..self.nodes.len()).map(RepoNodeId)
    }

    fn child(&self, parent: RepoNodeId, name: &str, kind: Option<RepoKind>) -> Option<RepoNodeId> {
        self.nodes[parent.0].children.iter().copied().find(|&c| {
            let n = &self.nodes[c.0];
            n.name == name && kind.map_or(true, |k| n.kind == k)
        })
    }

    /// Resolve a repository-relative path.
    ///
    /// `.` and `..` are handled like a filesystem resolver (`..` at the root
    /// stays at the root). A missing node is `Ok(None)`; walking through an
    /// RCS file as if it were a directory is `NotFound`. A file that is not
    /// in its directory is looked up in the directory's `Attic`.
    pub fn find(&self, rel: &str) -> Result<Option<RepoNodeId>> {
        let segs: Vec<&str> = rel.split('/').filter(|s| !s.is_empty()).collect();
        let mut cur = self.root();

        for (i, seg) in segs.iter().enumerate() {
            let last = i + 1 == segs.len();
            match *seg {
                "." => continue,
                ".." => {
                    cur = self.nodes[cur.0].parent.unwrap_or(cur);
                    continue;
                }
                _ => {}
            }
            if !self.nodes[cur.0].is_dir() {
                return Err(CvsError::NotFound(format!(
                    "{}: {} is not a directory",
                    rel,
                    self.path(cur)
                )));
            }
            let next = self.child(cur, seg, None).or_else(|| {
                if last {
                    self.child(cur, ATTIC, Some(RepoKind::Dir))
                        .and_then(|attic| self.child(attic, seg, Some(RepoKind::RcsFile)))
                } else {
                    None
                }
            });
            match next {
                Some(n) => cur = n,
                None => return Ok(None),
            }
        }
        Ok(Some(cur))
    }

    /// Like [`find`](Self::find) but the node must be a directory.
    pub fn find_dir(&self, rel: &str) -> Result<Option<RepoNodeId>> {
        match self.find(rel)? {
            Some(id) if self.nodes[id.0].is_dir() => Ok(Some(id)),
            Some(_) => Err(CvsError::NotADirectory(PathBuf::from(rel))),
            None => Ok(None),
        }
    }

    /// Repository-relative path of a node (`.` for the root).
    pub fn path(&self, id: RepoNodeId) -> String {
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
            return ".".to_string();
        }
        segs.reverse();
        segs.join("/")
    }

    /// On-disk path of a node (`name,v` for RCS files).
    pub fn disk_path(&self, id: RepoNodeId) -> PathBuf {
        if id == self.root() {
            return self.base.clone();
        }
        let rel = self.path(id);
        match self.nodes[id.0].kind {
            RepoKind::Dir => self.base.join(rel),
            RepoKind::RcsFile => self.base.join(format!("{}{}", rel, RCS_SUFFIX)),
        }
    }

    /// Add a directory node (e.g. after `add` of a directory), or return the
    /// existing one.
    pub fn insert_dir(&mut self, parent: RepoNodeId, name: &str) -> Result<RepoNodeId> {
        if !self.nodes[parent.0].is_dir() {
            return Err(CvsError::NotADirectory(PathBuf::from(self.path(parent))));
        }
        Ok(match self.child(parent, name, Some(RepoKind::Dir)) {
            Some(id) => id,
            None => self.insert(parent, name, RepoKind::Dir),
        })
    }

    /// Add an RCS file node (first commit of a file), or return the existing one.
    pub fn insert_file(&mut self, parent: RepoNodeId, name: &str) -> Result<RepoNodeId> {
        if !self.nodes[parent.0].is_dir() {
            return Err(CvsError::NotADirectory(PathBuf::from(self.path(parent))));
        }
        Ok(match self.child(parent, name, Some(RepoKind::RcsFile)) {
            Some(id) => id,
            None => self.insert(parent, name, RepoKind::RcsFile),
        })
    }

    /// Create every missing directory along `rel`, returning the last.
    pub fn ensure_dir_path(&mut self, rel: &str) -> Result<RepoNodeId> {
        let mut cur = self.root();
        for seg in rel.split('/').filter(|s| !s.is_empty() && *s != ".") {
            if seg == ".." {
                cur = self.nodes[cur.0].parent.unwrap_or(cur);
                continue;
            }
            cur = self.insert_dir(cur, seg)?;
        }
        Ok(cur)
    }
}

#[cfg(unix)]
fn check_mode(path: &Path, meta: &fs::Metadata, kind: RepoKind) {
    use std::os::unix::fs::MetadataExt;

    let mode = meta.mode();
    if mode & libc::S_IWOTH as u32 != 0 {
        tracing::warn!("{} is world-writable (mode {:o})", path.display(), mode & 0o7777);
    }
    if kind == RepoKind::RcsFile && mode & (libc::S_IWUSR as u32) != 0 {
        tracing::warn!(
            "RCS file {} is writable (mode {:o}); expected read-only",
            path.display(),
            mode & 0o7777
        );
    }
    let euid = nix::unistd::geteuid().as_raw();
    if euid != 0 && meta.uid() != euid && kind == RepoKind::Dir {
        tracing::warn!(
            "{} is owned by uid {}, not the server uid {}",
            path.display(),
            meta.uid(),
            euid
        );
    }
}

#[cfg(not(unix))]
fn check_mode(_path: &Path, _meta: &fs::Metadata, _kind: RepoKind) {}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_repo() -> TempDir {
        let tmp = TempDir::new().unwrap();
        let base = tmp.path();
        fs::create_dir_all(base.join("mod/sub")).unwrap();
        fs::create_dir_all(base.join("mod/Attic")).unwrap();
        fs::create_dir_all(base.join("CVSROOT")).unwrap();
        fs::write(base.join("mod/foo.c,v"), "head 1.1\n").unwrap();
        fs::write(base.join("mod/sub/bar.c,v"), "head 1.1\n").unwrap();
        fs::write(base.join("mod/Attic/old.c,v"), "head 1.2\n").unwrap();
        fs::write(base.join("mod/notes.txt"), "not rcs").unwrap();
        tmp
    }

    #[test]
    fn test_load_mirrors_disk() {
        let tmp = sample_repo();
        let tree = RepoTree::load(tmp.path(), LoadOptions::default()).unwrap();

        let m = tree.find("mod").unwrap().unwrap();
        assert!(tree.node(m).is_dir());
        let foo = tree.find("mod/foo.c").unwrap().unwrap();
        assert_eq!(tree.node(foo).kind, RepoKind::RcsFile);
        assert_eq!(tree.path(foo), "mod/foo.c");
        assert_eq!(tree.disk_path(foo), tmp.path().join("mod/foo.c,v"));
        assert!(tree.find("mod/notes.txt").unwrap().is_none());
    }

    #[test]
    fn test_children_sorted_by_name() {
        let tmp = sample_repo();
        fs::write(tmp.path().join("mod/zeta.c,v"), "head 1.1\n").unwrap();
        fs::write(tmp.path().join("mod/alpha.c,v"), "head 1.1\n").unwrap();
        let tree = RepoTree::load(tmp.path(), LoadOptions::default()).unwrap();

        let m = tree.find("mod").unwrap().unwrap();
        let names: Vec<&str> = tree.node(m).children().iter().map(|&c| tree.node(c).name.as_str()).collect();
        assert_eq!(names, vec!["Attic", "alpha.c", "foo.c", "sub", "zeta.c"]);
    }

    #[test]
    fn test_find_dot_segments() {
        let tmp = sample_repo();
        let tree = RepoTree::load(tmp.path(), LoadOptions::default()).unwrap();

        let bar = tree.find("mod/./sub/../sub/bar.c").unwrap().unwrap();
        assert_eq!(tree.path(bar), "mod/sub/bar.c");
        assert_eq!(tree.find("..").unwrap(), Some(tree.root()));
        assert_eq!(tree.find(".").unwrap(), Some(tree.root()));
        assert_eq!(tree.find("").unwrap(), Some(tree.root()));
        assert!(tree.find("mod/missing/x").unwrap().is_none());
    }

    #[test]
    fn test_find_through_file_fails() {
        let tmp = sample_repo();
        let tree = RepoTree::load(tmp.path(), LoadOptions::default()).unwrap();
        assert!(matches!(
            tree.find("mod/foo.c/x"),
            Err(CvsError::NotFound(_))
        ));
        assert!(tree.find_dir("mod/foo.c").is_err());
    }

    #[test]
    fn test_find_attic() {
        let tmp = sample_repo();
        let tree = RepoTree::load(tmp.path(), LoadOptions::default()).unwrap();
        let old = tree.find("mod/old.c").unwrap().unwrap();
        assert_eq!(tree.path(old), "mod/Attic/old.c");
    }

    #[test]
    fn test_insert_nodes() {
        let tmp = sample_repo();
        let mut tree = RepoTree::load(tmp.path(), LoadOptions::default()).unwrap();
        let d = tree.ensure_dir_path("mod/new/deeper").unwrap();
        assert_eq!(tree.path(d), "mod/new/deeper");
        let again = tree.ensure_dir_path("mod/new/deeper").unwrap();
        assert_eq!(d, again);
        let f = tree.insert_file(d, "x.c").unwrap();
        assert_eq!(tree.find("mod/new/deeper/x.c").unwrap(), Some(f));
        assert!(tree.insert_dir(f, "nope").is_err());
    }

    #[test]
    fn test_load_rejects_file_base() {
        let tmp = sample_repo();
        assert!(matches!(
            RepoTree::load(&tmp.path().join("mod/notes.txt"), LoadOptions::default()),
            Err(CvsError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_check_permissions_does_not_fail() {
        let tmp = sample_repo();
        let opts = LoadOptions {
            check_permissions: true,
        };
        assert!(RepoTree::load(tmp.path(), opts).is_ok());
    }
}

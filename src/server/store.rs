//! Revision storage seam.
//!
//! The server never parses RCS itself; it asks a [`RevisionStore`] for the
//! head revision of a file and its contents. Two stores ship with the crate:
//! [`MemoryStore`] for tests and embedding, and [`HeadStore`], which keeps
//! only the head revision of each file on disk.

use crate::error::{CvsError, Result};
use crate::repo::tree::{ATTIC, RCS_SUFFIX};
use crate::timestamp;
use bytes::Bytes;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Head revision of one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision {
    pub number: String,
    /// The file was removed at this revision.
    pub dead: bool,
    /// Seconds since the epoch when the revision was stored.
    pub mtime: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEntry {
    pub name: String,
    pub is_dir: bool,
}

pub trait RevisionStore: Send + Sync {
    /// Head revision of `path` (repository-relative, no `,v`).
    fn head(&self, path: &str) -> Result<Option<Revision>>;

    /// Contents of `path` at `rev`.
    fn checkout(&self, path: &str, rev: &str) -> Result<Bytes>;

    /// Store new contents, returning the new revision number.
    fn commit(&self, path: &str, data: &[u8], message: &str, author: &str) -> Result<String>;

    /// Mark the file dead, returning the revision that records the removal.
    fn remove(&self, path: &str, message: &str) -> Result<String>;

    /// Files and subdirectories of a repository directory.
    fn list(&self, dir: &str) -> Result<Vec<StoreEntry>>;

    /// Create a repository directory; false if it already existed.
    fn create_dir(&self, dir: &str) -> Result<bool>;
}

/// `1.4` -> `1.5`; anything unparsable starts over at `1.1`.
pub fn next_revision(rev: Option<&str>) -> String {
    rev.and_then(|r| {
        let (prefix, last) = r.rsplit_once('.')?;
        let n: u32 = last.parse().ok()?;
        Some(format!("{}.{}", prefix, n + 1))
    })
    .unwrap_or_else(|| "1.1".to_string())
}

fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() || dir == "." {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

#[derive(Debug, Clone)]
struct MemFile {
    rev: Revision,
    data: Bytes,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    files: Mutex<BTreeMap<String, MemFile>>,
    dirs: Mutex<BTreeMap<String, ()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a file at revision `rev`.
    pub fn insert(&self, path: &str, rev: &str, data: impl Into<Bytes>) {
        if let Some((dir, _)) = path.rsplit_once('/') {
            self.add_dirs(dir);
        }
        let file = MemFile {
            rev: Revision {
                number: rev.to_string(),
                dead: false,
                mtime: timestamp::now_secs(),
            },
            data: data.into(),
        };
        if let Ok(mut files) = self.files.lock() {
            files.insert(path.to_string(), file);
        }
    }

    fn add_dirs(&self, dir: &str) {
        if let Ok(mut dirs) = self.dirs.lock() {
            let mut acc = String::new();
            for seg in dir.split('/').filter(|s| !s.is_empty()) {
                acc = join(&acc, seg);
                dirs.insert(acc.clone(), ());
            }
        }
    }

    fn poisoned() -> CvsError {
        CvsError::Io(std::io::Error::other("revision store lock poisoned"))
    }
}

impl RevisionStore for MemoryStore {
    fn head(&self, path: &str) -> Result<Option<Revision>> {
        let files = self.files.lock().map_err(|_| Self::poisoned())?;
        Ok(files.get(path).map(|f| f.rev.clone()))
    }

    fn checkout(&self, path: &str, rev: &str) -> Result<Bytes> {
        let files = self.files.lock().map_err(|_| Self::poisoned())?;
        match files.get(path) {
            Some(f) if f.rev.number == rev && !f.rev.dead => Ok(f.data.clone()),
            _ => Err(CvsError::NotFound(format!("{} revision {}", path, rev))),
        }
    }

    fn commit(&self, path: &str, data: &[u8], _message: &str, _author: &str) -> Result<String> {
        if let Some((dir, _)) = path.rsplit_once('/') {
            self.add_dirs(dir);
        }
        let mut files = self.files.lock().map_err(|_| Self::poisoned())?;
        let number = next_revision(files.get(path).map(|f| f.rev.number.as_str()));
        files.insert(
            path.to_string(),
            MemFile {
                rev: Revision {
                    number: number.clone(),
                    dead: false,
                    mtime: timestamp::now_secs(),
                },
                data: Bytes::copy_from_slice(data),
            },
        );
        Ok(number)
    }

    fn remove(&self, path: &str, _message: &str) -> Result<String> {
        let mut files = self.files.lock().map_err(|_| Self::poisoned())?;
        let file = files
            .get_mut(path)
            .ok_or_else(|| CvsError::NotFound(path.to_string()))?;
        file.rev.number = next_revision(Some(&file.rev.number));
        file.rev.dead = true;
        file.data = Bytes::new();
        Ok(file.rev.number.clone())
    }

    fn list(&self, dir: &str) -> Result<Vec<StoreEntry>> {
        let prefix = if dir.is_empty() || dir == "." {
            String::new()
        } else {
            format!("{}/", dir)
        };
        let direct = |p: &str| -> Option<String> {
            let rest = p.strip_prefix(prefix.as_str())?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        };

        let mut out = Vec::new();
        let dirs = self.dirs.lock().map_err(|_| Self::poisoned())?;
        out.extend(dirs.keys().filter_map(|d| direct(d)).map(|name| StoreEntry { name, is_dir: true }));
        drop(dirs);
        let files = self.files.lock().map_err(|_| Self::poisoned())?;
        out.extend(files.keys().filter_map(|f| direct(f)).map(|name| StoreEntry { name, is_dir: false }));
        Ok(out)
    }

    fn create_dir(&self, dir: &str) -> Result<bool> {
        let existed = self
            .dirs
            .lock()
            .map_err(|_| Self::poisoned())?
            .contains_key(dir);
        self.add_dirs(dir);
        Ok(!existed)
    }
}

// =============================================================================
// HeadStore
// =============================================================================

/// On-disk store keeping only each file's head revision.
///
/// `name,v` starts with a header line `head <rev>` (or `head <rev> dead`)
/// followed by the head contents. Removed files move to `Attic/`.
#[derive(Debug, Clone)]
pub struct HeadStore {
    base: PathBuf,
}

const HEAD_PREFIX: &str = "head ";
const DEAD_MARK: &str = " dead";

impl HeadStore {
    pub fn new(base: &Path) -> Self {
        Self {
            base: base.to_path_buf(),
        }
    }

    fn rcs_path(&self, path: &str) -> PathBuf {
        self.base.join(format!("{}{}", path, RCS_SUFFIX))
    }

    fn attic_path(&self, path: &str) -> PathBuf {
        let (dir, name) = path.rsplit_once('/').unwrap_or(("", path));
        self.base
            .join(dir)
            .join(ATTIC)
            .join(format!("{}{}", name, RCS_SUFFIX))
    }

    /// Live file first, then the Attic.
    fn locate(&self, path: &str) -> Option<PathBuf> {
        [self.rcs_path(path), self.attic_path(path)]
            .into_iter()
            .find(|p| p.is_file())
    }

    fn read(&self, file: &Path) -> Result<(Revision, Bytes)> {
        let raw = fs::read(file).map_err(|e| CvsError::io_at(file, e))?;
        let meta = fs::metadata(file).map_err(|e| CvsError::io_at(file, e))?;
        let nl = raw.iter().position(|&b| b == b'\n').unwrap_or(raw.len());
        let header = std::str::from_utf8(&raw[..nl]).unwrap_or_default();
        let spec = header.strip_prefix(HEAD_PREFIX).ok_or_else(|| {
            CvsError::NotFound(format!("{}: missing head header", file.display()))
        })?;
        let (number, dead) = match spec.strip_suffix(DEAD_MARK) {
            Some(n) => (n.trim(), true),
            None => (spec.trim(), false),
        };
        let body = raw.get(nl + 1..).unwrap_or_default();
        Ok((
            Revision {
                number: number.to_string(),
                dead,
                mtime: timestamp::mtime_secs(&meta),
            },
            Bytes::copy_from_slice(body),
        ))
    }

    fn write(&self, file: &Path, rev: &str, dead: bool, data: &[u8]) -> Result<()> {
        let dir = file
            .parent()
            .ok_or_else(|| CvsError::NotFound(file.display().to_string()))?;
        fs::create_dir_all(dir).map_err(|e| CvsError::io_at(dir, e))?;
        let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| CvsError::io_at(dir, e))?;
        let header = format!("{}{}{}\n", HEAD_PREFIX, rev, if dead { DEAD_MARK } else { "" });
        tmp.write_all(header.as_bytes())
            .and_then(|_| tmp.write_all(data))
            .map_err(|e| CvsError::io_at(tmp.path(), e))?;
        tmp.persist(file).map_err(|e| CvsError::io_at(file, e.error))?;
        set_read_only(file);
        Ok(())
    }
}

#[cfg(unix)]
fn set_read_only(file: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = fs::set_permissions(file, fs::Permissions::from_mode(0o444)) {
        tracing::debug!("Cannot make {} read-only: {}", file.display(), e);
    }
}

#[cfg(not(unix))]
fn set_read_only(_file: &Path) {}

impl RevisionStore for HeadStore {
    fn head(&self, path: &str) -> Result<Option<Revision>> {
        match self.locate(path) {
            Some(file) => Ok(Some(self.read(&file)?.0)),
            None => Ok(None),
        }
    }

    fn checkout(&self, path: &str, rev: &str) -> Result<Bytes> {
        let file = self
            .locate(path)
            .ok_or_else(|| CvsError::NotFound(path.to_string()))?;
        let (head, data) = self.read(&file)?;
        if head.number != rev || head.dead {
            return Err(CvsError::NotFound(format!(
                "{} revision {} (only head {} is stored)",
                path, rev, head.number
            )));
        }
        Ok(data)
    }

    fn commit(&self, path: &str, data: &[u8], message: &str, author: &str) -> Result<String> {
        let previous = match self.locate(path) {
            Some(file) => Some(self.read(&file)?.0.number),
            None => None,
        };
        let number = next_revision(previous.as_deref());
        let live = self.rcs_path(path);
        self.write(&live, &number, false, data)?;

        // Resurrected from the Attic.
        let attic = self.attic_path(path);
        if attic.is_file() {
            fs::remove_file(&attic).map_err(|e| CvsError::io_at(&attic, e))?;
        }
        tracing::info!(
            "{} committed revision {} of {} ({} bytes): {}",
            author,
            number,
            path,
            data.len(),
            message.lines().next().unwrap_or_default()
        );
        Ok(number)
    }

    fn remove(&self, path: &str, message: &str) -> Result<String> {
        let live = self.rcs_path(path);
        if !live.is_file() {
            return Err(CvsError::NotFound(path.to_string()));
        }
        let (head, _) = self.read(&live)?;
        let number = next_revision(Some(&head.number));
        self.write(&self.attic_path(path), &number, true, &[])?;
        fs::remove_file(&live).map_err(|e| CvsError::io_at(&live, e))?;
        tracing::info!("Removed {} at revision {}: {}", path, number, message);
        Ok(number)
    }

    fn list(&self, dir: &str) -> Result<Vec<StoreEntry>> {
        let path = self.base.join(dir);
        let read_dir = match fs::read_dir(&path) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(CvsError::io_at(&path, e)),
        };
        let mut out = Vec::new();
        for dirent in read_dir {
            let dirent = dirent.map_err(|e| CvsError::io_at(&path, e))?;
            let Ok(name) = dirent.file_name().into_string() else {
                continue;
            };
            let is_dir = dirent.file_type().map(|t| t.is_dir()).unwrap_or(false);
            if is_dir {
                if name != ATTIC && name != "CVSROOT" {
                    out.push(StoreEntry { name, is_dir: true });
                }
            } else if let Some(stem) = name.strip_suffix(RCS_SUFFIX) {
                out.push(StoreEntry {
                    name: stem.to_string(),
                    is_dir: false,
                });
            }
        }
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    fn create_dir(&self, dir: &str) -> Result<bool> {
        let path = self.base.join(dir);
        if path.is_dir() {
            return Ok(false);
        }
        fs::create_dir_all(&path).map_err(|e| CvsError::io_at(&path, e))?;
        Ok(true)
    }
}

/// Produces the body of a `diff` for one file.
pub trait DiffEngine: Send + Sync {
    fn diff(&self, path: &str, old: &[u8], new: &[u8]) -> Vec<String>;
}

/// Reports only whether contents differ.
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryDiff;

impl DiffEngine for BinaryDiff {
    fn diff(&self, _path: &str, old: &[u8], new: &[u8]) -> Vec<String> {
        if old == new {
            Vec::new()
        } else {
            vec!["Files differ".to_string()]
        }
    }
}

//! Per-directory Entries store.
//!
//! One line per tracked file: `/name/revision/timestamp/options/tag`.
//! One line per tracked subdirectory: `D/name////`.
//! Appends made by other tools land in `CVS/Entries.Log` (`A <line>` /
//! `R <line>`) and are folded in on open; close rewrites `CVS/Entries` in full.

use crate::error::{CvsError, ProtocolError, Result};
use crate::timestamp;
use fs2::FileExt;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

pub const ADMIN_DIR: &str = "CVS";
pub const ENTRIES_FILE: &str = "Entries";
pub const ENTRIES_LOG_FILE: &str = "Entries.Log";
pub const ENTRIES_LOCK_FILE: &str = "Entries.Lock";

/// Revision of a file that has been added but never committed.
pub const ADDED_REVISION: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Dir,
}

/// The timestamp field of an entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryTimestamp {
    /// Checkout time in unix seconds.
    At(i64),
    /// `Initial <name>`: added, never checked out.
    Initial(String),
    /// `dummy timestamp`: forces a comparison on next status.
    Dummy,
    /// `Result of merge`: always considered modified.
    ResultOfMerge,
    /// `=`: the peer claims the file is unchanged.
    Unchanged,
    /// `M`: the peer claims the file is modified.
    Modified,
    /// Anything else, preserved verbatim.
    Other(String),
}

impl EntryTimestamp {
    pub fn parse(s: &str) -> Self {
        match s {
            "" => EntryTimestamp::Other(String::new()),
            "=" => EntryTimestamp::Unchanged,
            "M" => EntryTimestamp::Modified,
            "dummy timestamp" => EntryTimestamp::Dummy,
            "Result of merge" => EntryTimestamp::ResultOfMerge,
            _ => {
                if let Some(name) = s.strip_prefix("Initial ") {
                    return EntryTimestamp::Initial(name.to_string());
                }
                match timestamp::parse_entry_time(s) {
                    // Only canonical spellings become `At`; anything else is
                    // kept byte-for-byte.
                    Some(secs) if timestamp::format_entry_time(secs) == s => {
                        EntryTimestamp::At(secs)
                    }
                    _ => EntryTimestamp::Other(s.to_string()),
                }
            }
        }
    }
}

impl fmt::Display for EntryTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryTimestamp::At(secs) => f.write_str(&timestamp::format_entry_time(*secs)),
            EntryTimestamp::Initial(name) => write!(f, "Initial {}", name),
            EntryTimestamp::Dummy => f.write_str("dummy timestamp"),
            EntryTimestamp::ResultOfMerge => f.write_str("Result of merge"),
            EntryTimestamp::Unchanged => f.write_str("="),
            EntryTimestamp::Modified => f.write_str("M"),
            EntryTimestamp::Other(s) => f.write_str(s),
        }
    }
}

/// One line of a directory's Entries file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryRecord {
    pub name: String,
    pub revision: String,
    pub checkout_timestamp: EntryTimestamp,
    pub conflict_timestamp: Option<String>,
    /// Keyword expansion options, e.g. `-kb`.
    pub keyword_opts: String,
    /// Sticky tag with its type prefix (`T`, `N` or `D`), empty when none.
    pub tag: String,
    pub kind: EntryKind,
}

impl EntryRecord {
    pub fn file(name: impl Into<String>, revision: impl Into<String>, ts: EntryTimestamp) -> Self {
        Self {
            name: name.into(),
            revision: revision.into(),
            checkout_timestamp: ts,
            conflict_timestamp: None,
            keyword_opts: String::new(),
            tag: String::new(),
            kind: EntryKind::File,
        }
    }

    pub fn dir(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            revision: String::new(),
            checkout_timestamp: EntryTimestamp::Other(String::new()),
            conflict_timestamp: None,
            keyword_opts: String::new(),
            tag: String::new(),
            kind: EntryKind::Dir,
        }
    }

    pub fn is_added(&self) -> bool {
        self.revision == ADDED_REVISION
    }

    /// Removed locally, not yet committed (revision carries a leading `-`).
    pub fn is_removed(&self) -> bool {
        self.revision.starts_with('-')
    }

    /// Sticky tag name without its type prefix.
    pub fn sticky_tag(&self) -> Option<&str> {
        let mut chars = self.tag.chars();
        match chars.next() {
            Some('T') | Some('N') | Some('D') => Some(chars.as_str()),
            _ => None,
        }
    }

    /// Parse one Entries line. Returns `None` for the bare `D` marker.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let malformed = || {
            CvsError::from(ProtocolError::Malformed {
                what: "entry line",
                line: line.to_string(),
            })
        };

        if line == "D" {
            return Ok(None);
        }
        let (kind, rest) = if let Some(rest) = line.strip_prefix("D/") {
            (EntryKind::Dir, rest)
        } else if let Some(rest) = line.strip_prefix('/') {
            (EntryKind::File, rest)
        } else {
            return Err(malformed());
        };

        let fields: Vec<&str> = rest.splitn(5, '/').collect();
        if fields.len() != 5 || fields[0].is_empty() {
            return Err(malformed());
        }

        let (ts, conflict) = match fields[2].split_once('+') {
            Some((ts, conflict)) => (ts, Some(conflict.to_string())),
            None => (fields[2], None),
        };

        Ok(Some(Self {
            name: fields[0].to_string(),
            revision: fields[1].to_string(),
            checkout_timestamp: EntryTimestamp::parse(ts),
            conflict_timestamp: conflict,
            keyword_opts: fields[3].to_string(),
            tag: fields[4].to_string(),
            kind,
        }))
    }
}

impl fmt::Display for EntryRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.kind == EntryKind::Dir {
            return write!(f, "D/{}////", self.name);
        }
        write!(f, "/{}/{}/{}", self.name, self.revision, self.checkout_timestamp)?;
        if let Some(ref conflict) = self.conflict_timestamp {
            write!(f, "+{}", conflict)?;
        }
        write!(f, "/{}/{}", self.keyword_opts, self.tag)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Read,
    Write,
}

/// Open handle on one directory's Entries.
///
/// Writable handles hold an exclusive lock on `CVS/Entries.Lock` until
/// closed or dropped, so two processes cannot rewrite the same file.
pub struct Entries {
    dir: PathBuf,
    mode: OpenMode,
    records: BTreeMap<String, EntryRecord>,
    subdirs_complete: bool,
    dirty: bool,
    lock: Option<File>,
}

impl Entries {
    /// Open the Entries of `dir`, creating `dir/CVS` in write mode.
    pub fn open(dir: &Path, mode: OpenMode) -> Result<Self> {
        let admin = dir.join(ADMIN_DIR);
        let lock = match mode {
            OpenMode::Write => {
                fs::create_dir_all(&admin).map_err(|e| CvsError::io_at(&admin, e))?;
                let lock_path = admin.join(ENTRIES_LOCK_FILE);
                let file = OpenOptions::new()
                    .create(true)
                    .truncate(false)
                    .write(true)
                    .open(&lock_path)
                    .map_err(|e| CvsError::io_at(&lock_path, e))?;
                file.try_lock_exclusive().map_err(|_| {
                    CvsError::Permission(format!(
                        "{} is being rewritten by another process",
                        admin.join(ENTRIES_FILE).display()
                    ))
                })?;
                Some(file)
            }
            OpenMode::Read => None,
        };

        let mut entries = Self {
            dir: dir.to_path_buf(),
            mode,
            records: BTreeMap::new(),
            subdirs_complete: false,
            dirty: false,
            lock,
        };
        entries.load()?;
        Ok(entries)
    }

    /// Entries that are never persisted (server-side scratch, tests).
    pub fn in_memory(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            mode: OpenMode::Read,
            records: BTreeMap::new(),
            subdirs_complete: false,
            dirty: false,
            lock: None,
        }
    }

    fn load(&mut self) -> Result<()> {
        let admin = self.dir.join(ADMIN_DIR);
        let path = admin.join(ENTRIES_FILE);
        if path.exists() {
            let file = File::open(&path).map_err(|e| CvsError::io_at(&path, e))?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| CvsError::io_at(&path, e))?;
                self.apply_line(&line, &path);
            }
        }

        let log = admin.join(ENTRIES_LOG_FILE);
        if log.exists() {
            let file = File::open(&log).map_err(|e| CvsError::io_at(&log, e))?;
            for line in BufReader::new(file).lines() {
                let line = line.map_err(|e| CvsError::io_at(&log, e))?;
                match line.split_once(' ') {
                    Some(("A", rest)) => self.apply_line(rest, &log),
                    Some(("R", rest)) => {
                        if let Ok(Some(rec)) = EntryRecord::parse(rest) {
                            self.records.remove(&rec.name);
                        }
                    }
                    _ => tracing::warn!("Skipping malformed line in {}: {}", log.display(), line),
                }
            }
            // Folded into the in-memory set; the next close rewrites Entries.
            self.dirty = true;
        }
        Ok(())
    }

    fn apply_line(&mut self, line: &str, source: &Path) {
        if line.trim().is_empty() {
            return;
        }
        match EntryRecord::parse(line) {
            Ok(Some(rec)) => {
                self.records.insert(rec.name.clone(), rec);
            }
            Ok(None) => self.subdirs_complete = true,
            Err(_) => tracing::warn!("Skipping malformed line in {}: {}", source.display(), line),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn get(&self, name: &str) -> Option<&EntryRecord> {
        self.records.get(name)
    }

    /// Insert a record, replacing any existing record with the same name.
    pub fn add(&mut self, record: EntryRecord) {
        self.records.insert(record.name.clone(), record);
        self.dirty = true;
    }

    pub fn remove(&mut self, name: &str) -> Option<EntryRecord> {
        let removed = self.records.remove(name);
        if removed.is_some() {
            self.dirty = true;
        }
        removed
    }

    pub fn iter(&self) -> impl Iterator<Item = &EntryRecord> {
        self.records.values()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Whether the Entries file lists every subdirectory (`D` marker).
    pub fn subdirs_complete(&self) -> bool {
        self.subdirs_complete
    }

    pub fn set_subdirs_complete(&mut self) {
        if !self.subdirs_complete {
            self.subdirs_complete = true;
            self.dirty = true;
        }
    }

    /// Flush pending writes and release the handle.
    pub fn close(mut self) -> Result<()> {
        let result = self.flush();
        self.dirty = false;
        result
    }

    fn flush(&mut self) -> Result<()> {
        if !self.dirty || self.mode != OpenMode::Write {
            return Ok(());
        }

        let admin = self.dir.join(ADMIN_DIR);
        let path = admin.join(ENTRIES_FILE);
        let mut tmp =
            tempfile::NamedTempFile::new_in(&admin).map_err(|e| CvsError::io_at(&admin, e))?;
        for rec in self.records.values() {
            writeln!(tmp, "{}", rec).map_err(|e| CvsError::io_at(tmp.path(), e))?;
        }
        if self.subdirs_complete {
            writeln!(tmp, "D").map_err(|e| CvsError::io_at(tmp.path(), e))?;
        }
        tmp.as_file()
            .sync_all()
            .map_err(|e| CvsError::io_at(tmp.path(), e))?;
        tmp.persist(&path)
            .map_err(|e| CvsError::io_at(&path, e.error))?;

        let log = admin.join(ENTRIES_LOG_FILE);
        if log.exists() {
            fs::remove_file(&log).map_err(|e| CvsError::io_at(&log, e))?;
        }

        tracing::debug!("Wrote {} entries to {}", self.records.len(), path.display());
        self.dirty = false;
        Ok(())
    }
}

impl Drop for Entries {
    fn drop(&mut self) {
        if self.dirty {
            if let Err(e) = self.flush() {
                tracing::error!("Failed to flush entries for {}: {}", self.dir.display(), e);
            }
        }
        if let Some(ref lock) = self.lock {
            let _ = FileExt::unlock(lock);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_file_line() {
        let rec = EntryRecord::parse("/foo.c/1.4/Sun Oct 18 12:00:00 2026/-kb/Trel-1")
            .unwrap()
            .unwrap();
        assert_eq!(rec.name, "foo.c");
        assert_eq!(rec.revision, "1.4");
        assert_eq!(rec.checkout_timestamp, EntryTimestamp::At(1_792_324_800));
        assert_eq!(rec.keyword_opts, "-kb");
        assert_eq!(rec.sticky_tag(), Some("rel-1"));
        assert_eq!(rec.kind, EntryKind::File);
    }

    #[test]
    fn test_parse_conflict_and_dir() {
        let rec = EntryRecord::parse("/a/1.2/Result of merge+Sun Oct 18 12:00:00 2026//")
            .unwrap()
            .unwrap();
        assert_eq!(rec.checkout_timestamp, EntryTimestamp::ResultOfMerge);
        assert_eq!(
            rec.conflict_timestamp.as_deref(),
            Some("Sun Oct 18 12:00:00 2026")
        );

        let dir = EntryRecord::parse("D/sub////").unwrap().unwrap();
        assert_eq!(dir.kind, EntryKind::Dir);
        assert_eq!(dir.to_string(), "D/sub////");

        assert!(EntryRecord::parse("D").unwrap().is_none());
        assert!(EntryRecord::parse("garbage").is_err());
        assert!(EntryRecord::parse("/only/two").is_err());
    }

    #[test]
    fn test_added_and_removed() {
        let added = EntryRecord::file("n", "0", EntryTimestamp::Initial("n".into()));
        assert!(added.is_added());
        assert_eq!(added.to_string(), "/n/0/Initial n//");
        let removed = EntryRecord::file("n", "-1.3", EntryTimestamp::Dummy);
        assert!(removed.is_removed());
    }

    #[test]
    fn test_store_roundtrip() {
        let tmp = TempDir::new().unwrap();
        let mut e = Entries::open(tmp.path(), OpenMode::Write).unwrap();
        e.add(EntryRecord::file("a", "1.1", EntryTimestamp::At(1_792_324_800)));
        e.add(EntryRecord::dir("sub"));
        e.set_subdirs_complete();
        e.close().unwrap();

        let e = Entries::open(tmp.path(), OpenMode::Read).unwrap();
        assert_eq!(e.len(), 2);
        assert_eq!(e.get("a").unwrap().revision, "1.1");
        assert_eq!(e.get("sub").unwrap().kind, EntryKind::Dir);
        assert!(e.subdirs_complete());
    }

    #[test]
    fn test_add_replaces_and_remove() {
        let tmp = TempDir::new().unwrap();
        let mut e = Entries::open(tmp.path(), OpenMode::Write).unwrap();
        e.add(EntryRecord::file("a", "1.1", EntryTimestamp::Dummy));
        e.add(EntryRecord::file("a", "1.2", EntryTimestamp::Dummy));
        assert_eq!(e.len(), 1);
        assert_eq!(e.get("a").unwrap().revision, "1.2");
        assert!(e.remove("a").is_some());
        assert!(e.remove("a").is_none());
        e.close().unwrap();

        let e = Entries::open(tmp.path(), OpenMode::Read).unwrap();
        assert!(e.is_empty());
    }

    #[test]
    fn test_second_writer_rejected() {
        let tmp = TempDir::new().unwrap();
        let first = Entries::open(tmp.path(), OpenMode::Write).unwrap();
        assert!(Entries::open(tmp.path(), OpenMode::Write).is_err());
        first.close().unwrap();
        assert!(Entries::open(tmp.path(), OpenMode::Write).is_ok());
    }

    #[test]
    fn test_entries_log_is_folded_in() {
        let tmp = TempDir::new().unwrap();
        let admin = tmp.path().join(ADMIN_DIR);
        fs::create_dir_all(&admin).unwrap();
        fs::write(admin.join(ENTRIES_FILE), "/a/1.1/dummy timestamp//\n/b/1.1/dummy timestamp//\n")
            .unwrap();
        fs::write(
            admin.join(ENTRIES_LOG_FILE),
            "A /c/0/Initial c//\nR /a/1.1/dummy timestamp//\n",
        )
        .unwrap();

        let e = Entries::open(tmp.path(), OpenMode::Write).unwrap();
        let names: Vec<_> = e.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["b", "c"]);
        e.close().unwrap();
        assert!(!admin.join(ENTRIES_LOG_FILE).exists());
    }

    #[test]
    fn test_malformed_lines_skipped() {
        let tmp = TempDir::new().unwrap();
        let admin = tmp.path().join(ADMIN_DIR);
        fs::create_dir_all(&admin).unwrap();
        fs::write(admin.join(ENTRIES_FILE), "junk\n/ok/1.1/dummy timestamp//\n").unwrap();
        let e = Entries::open(tmp.path(), OpenMode::Read).unwrap();
        assert_eq!(e.len(), 1);
    }

    fn field() -> impl Strategy<Value = String> {
        "[A-Za-z0-9._-]{1,12}"
    }

    proptest! {
        #[test]
        fn prop_store_roundtrip(
            recs in proptest::collection::btree_map(
                field(),
                (field(), 0i64..4_000_000_000, proptest::option::of("-k[bvo]"), proptest::option::of(field())),
                0..16,
            )
        ) {
            let tmp = TempDir::new().unwrap();
            let mut e = Entries::open(tmp.path(), OpenMode::Write).unwrap();
            let mut expected = Vec::new();
            for (name, (rev, secs, opts, tag)) in recs {
                let mut rec = EntryRecord::file(name, rev, EntryTimestamp::At(secs));
                rec.keyword_opts = opts.unwrap_or_default();
                rec.tag = tag.map(|t| format!("T{}", t)).unwrap_or_default();
                expected.push(rec.clone());
                e.add(rec);
            }
            e.close().unwrap();

            let e = Entries::open(tmp.path(), OpenMode::Read).unwrap();
            let got: Vec<_> = e.iter().cloned().collect();
            prop_assert_eq!(got, expected);
        }
    }
}

//! Per-directory administrative files besides Entries.
//!
//! `CVS/Root` holds the repository root spec, `CVS/Repository` the
//! repository-relative path of the directory, `CVS/Tag` the directory's
//! sticky tag (with its `T`/`N`/`D` prefix).

use crate::entries::{Entries, OpenMode, ADMIN_DIR};
use crate::error::{CvsError, Result};
use std::fs;
use std::path::Path;

pub const ROOT_FILE: &str = "Root";
pub const REPOSITORY_FILE: &str = "Repository";
pub const TAG_FILE: &str = "Tag";

fn read_single_line(path: &Path) -> Result<Option<String>> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s.lines().next().map(|l| l.trim_end().to_string())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(CvsError::io_at(path, e)),
    }
}

fn write_single_line(path: &Path, value: &str) -> Result<()> {
    fs::write(path, format!("{}\n", value)).map_err(|e| CvsError::io_at(path, e))
}

pub fn read_root(dir: &Path) -> Result<Option<String>> {
    read_single_line(&dir.join(ADMIN_DIR).join(ROOT_FILE))
}

pub fn read_repository(dir: &Path) -> Result<Option<String>> {
    read_single_line(&dir.join(ADMIN_DIR).join(REPOSITORY_FILE))
}

pub fn read_tag(dir: &Path) -> Result<Option<String>> {
    read_single_line(&dir.join(ADMIN_DIR).join(TAG_FILE))
}

/// Set or clear the directory's sticky tag.
pub fn write_tag(dir: &Path, tag: Option<&str>) -> Result<()> {
    let path = dir.join(ADMIN_DIR).join(TAG_FILE);
    match tag {
        Some(t) => write_single_line(&path, t),
        None => match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(CvsError::io_at(&path, e)),
        },
    }
}

pub fn is_admin_dir(dir: &Path) -> bool {
    dir.join(ADMIN_DIR).join(ROOT_FILE).is_file()
        || dir.join(ADMIN_DIR).join(REPOSITORY_FILE).is_file()
}

/// Create `dir/CVS` with Root, Repository, an empty Entries and optional Tag.
///
/// Existing Root/Repository files are left alone; the directory may already
/// be a working directory of the same module.
pub fn create_admin_dir(dir: &Path, root: &str, repository: &str, tag: Option<&str>) -> Result<()> {
    let admin = dir.join(ADMIN_DIR);
    fs::create_dir_all(&admin).map_err(|e| CvsError::io_at(&admin, e))?;

    if read_root(dir)?.is_none() {
        write_single_line(&admin.join(ROOT_FILE), root)?;
    }
    match read_repository(dir)? {
        Some(existing) if existing != repository => {
            tracing::warn!(
                "{} already tracks {}, not {}",
                dir.display(),
                existing,
                repository
            );
        }
        Some(_) => {}
        None => write_single_line(&admin.join(REPOSITORY_FILE), repository)?,
    }
    write_tag(dir, tag)?;

    // Materialize an empty Entries file so the directory scans as tracked.
    let mut entries = Entries::open(dir, OpenMode::Write)?;
    entries.set_subdirs_complete();
    entries.close()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_create_and_read() {
        let tmp = TempDir::new().unwrap();
        create_admin_dir(tmp.path(), "/cvsroot", "mod/sub", Some("Tbranch")).unwrap();

        assert_eq!(read_root(tmp.path()).unwrap().as_deref(), Some("/cvsroot"));
        assert_eq!(read_repository(tmp.path()).unwrap().as_deref(), Some("mod/sub"));
        assert_eq!(read_tag(tmp.path()).unwrap().as_deref(), Some("Tbranch"));
        assert!(is_admin_dir(tmp.path()));
        assert!(tmp.path().join("CVS/Entries").is_file());
    }

    #[test]
    fn test_missing_files_are_none() {
        let tmp = TempDir::new().unwrap();
        assert_eq!(read_root(tmp.path()).unwrap(), None);
        assert!(!is_admin_dir(tmp.path()));
    }

    #[test]
    fn test_clear_tag() {
        let tmp = TempDir::new().unwrap();
        create_admin_dir(tmp.path(), "/r", "m", Some("Tx")).unwrap();
        write_tag(tmp.path(), None).unwrap();
        assert_eq!(read_tag(tmp.path()).unwrap(), None);
        write_tag(tmp.path(), None).unwrap();
    }
}

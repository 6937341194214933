//! Daemon configuration.
//!
//! Values come from built-in defaults, then `/etc/rcvsd.toml` (or the file
//! named with `--config`), then command-line flags.

use crate::error::{CvsError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/rcvsd.toml";
pub const DEFAULT_PORT: u16 = 2401;

fn default_max_workers() -> usize {
    (num_cpus::get() * 2).max(2)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Address to accept connections on.
    pub listen: String,
    /// Repository root served to clients.
    pub repository: PathBuf,
    pub max_workers: usize,
    /// Unprivileged account workers switch to.
    pub user: Option<String>,
    pub group: Option<String>,
    /// Confine workers to the repository with chroot(2).
    pub chroot: bool,
    pub check_permissions: bool,
    /// Seconds a lock request may wait; 0 waits forever.
    pub lock_timeout_secs: u64,
    /// Session scratch space, relative to the repository so it survives
    /// the chroot.
    pub scratch_dir: PathBuf,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen: format!("0.0.0.0:{}", DEFAULT_PORT),
            repository: PathBuf::from("/var/cvs"),
            max_workers: default_max_workers(),
            user: None,
            group: None,
            chroot: true,
            check_permissions: false,
            lock_timeout_secs: 0,
            scratch_dir: PathBuf::from("CVSROOT/tmp"),
        }
    }
}

/// Flag values that override the file.
#[derive(Debug, Clone, Default)]
pub struct DaemonOverrides {
    pub listen: Option<String>,
    pub repository: Option<PathBuf>,
    pub max_workers: Option<usize>,
    pub user: Option<String>,
    pub group: Option<String>,
    pub no_chroot: bool,
    pub check_permissions: bool,
    pub lock_timeout_secs: Option<u64>,
}

impl DaemonConfig {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| CvsError::Config(e.to_string()))
    }

    /// Load the named file, or the default file if it exists.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathBuf::from(DEFAULT_CONFIG_PATH), false),
        };
        match fs::read_to_string(&path) {
            Ok(text) => {
                let cfg = Self::parse(&text)
                    .map_err(|e| CvsError::Config(format!("{}: {}", path.display(), e)))?;
                tracing::debug!("Loaded configuration from {}", path.display());
                Ok(cfg)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound && !required => Ok(Self::default()),
            Err(e) => Err(CvsError::io_at(path, e)),
        }
    }

    pub fn apply(&mut self, o: DaemonOverrides) {
        if let Some(v) = o.listen {
            self.listen = v;
        }
        if let Some(v) = o.repository {
            self.repository = v;
        }
        if let Some(v) = o.max_workers {
            self.max_workers = v;
        }
        if o.user.is_some() {
            self.user = o.user;
        }
        if o.group.is_some() {
            self.group = o.group;
        }
        if o.no_chroot {
            self.chroot = false;
        }
        if o.check_permissions {
            self.check_permissions = true;
        }
        if let Some(v) = o.lock_timeout_secs {
            self.lock_timeout_secs = v;
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(CvsError::Config("max_workers must be at least 1".into()));
        }
        if !self.repository.is_absolute() {
            return Err(CvsError::Config(format!(
                "repository must be an absolute path, got {}",
                self.repository.display()
            )));
        }
        let escapes = self
            .scratch_dir
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes || self.scratch_dir.as_os_str().is_empty() {
            return Err(CvsError::Config(format!(
                "scratch_dir must be a path inside the repository, got {}",
                self.scratch_dir.display()
            )));
        }
        Ok(())
    }

    /// Scratch directory as the daemon sees it.
    pub fn scratch_path(&self) -> PathBuf {
        self.repository.join(&self.scratch_dir)
    }

    /// Scratch directory as a worker sees it, after any chroot.
    pub fn worker_scratch_path(&self) -> PathBuf {
        if self.chroot {
            Path::new("/").join(&self.scratch_dir)
        } else {
            self.scratch_path()
        }
    }

    pub fn lock_timeout(&self) -> Option<Duration> {
        (self.lock_timeout_secs > 0).then(|| Duration::from_secs(self.lock_timeout_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let cfg = DaemonConfig::parse("repository = \"/srv/cvs\"\nmax_workers = 3\n").unwrap();
        assert_eq!(cfg.repository, PathBuf::from("/srv/cvs"));
        assert_eq!(cfg.max_workers, 3);
        assert!(cfg.chroot);
        assert_eq!(cfg.listen, "0.0.0.0:2401");
        assert_eq!(cfg.lock_timeout(), None);
    }

    #[test]
    fn test_flags_override_file() {
        let mut cfg = DaemonConfig::parse("max_workers = 3\nlock_timeout_secs = 5\n").unwrap();
        cfg.apply(DaemonOverrides {
            max_workers: Some(8),
            no_chroot: true,
            ..Default::default()
        });
        assert_eq!(cfg.max_workers, 8);
        assert!(!cfg.chroot);
        assert_eq!(cfg.lock_timeout(), Some(Duration::from_secs(5)));
    }

    #[test]
    fn test_load_errors() {
        let tmp = TempDir::new().unwrap();
        let missing = tmp.path().join("nope.toml");
        assert!(DaemonConfig::load(Some(&missing)).is_err());

        let bad = tmp.path().join("bad.toml");
        fs::write(&bad, "max_workers = \"many\"").unwrap();
        assert!(matches!(DaemonConfig::load(Some(&bad)), Err(CvsError::Config(_))));
    }

    #[test]
    fn test_validate() {
        let mut cfg = DaemonConfig::default();
        assert!(cfg.validate().is_ok());
        assert!(cfg.max_workers >= 2);
        cfg.max_workers = 0;
        assert!(cfg.validate().is_err());
        cfg.max_workers = 1;
        cfg.repository = PathBuf::from("relative");
        assert!(cfg.validate().is_err());
        cfg.repository = PathBuf::from("/srv/cvs");
        cfg.scratch_dir = PathBuf::from("../tmp");
        assert!(cfg.validate().is_err());
        cfg.scratch_dir = PathBuf::from("/tmp");
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_scratch_inside_chroot() {
        let mut cfg = DaemonConfig::parse("repository = \"/srv/cvs\"\n").unwrap();
        assert_eq!(cfg.scratch_path(), PathBuf::from("/srv/cvs/CVSROOT/tmp"));
        assert_eq!(cfg.worker_scratch_path(), PathBuf::from("/CVSROOT/tmp"));
        cfg.chroot = false;
        assert_eq!(cfg.worker_scratch_path(), PathBuf::from("/srv/cvs/CVSROOT/tmp"));
    }
}

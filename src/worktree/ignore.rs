//! Ignore patterns for unknown files.
//!
//! The set starts with the built-in defaults, then takes the user's
//! `~/.cvsignore`, the `CVSIGNORE` environment variable, and each
//! directory's `.cvsignore` as the scan descends. A lone `!` clears
//! everything accumulated so far.

use glob::Pattern;
use std::fs;
use std::path::Path;

pub const USER_IGNORE_FILE: &str = ".cvsignore";
pub const IGNORE_ENV: &str = "CVSIGNORE";

const DEFAULT_IGNORES: &[&str] = &[
    ".", "..", "core", "RCSLOG", "tags", "TAGS", "RCS", "SCCS", ".make.state", ".nse_depinfo",
    "#*", ".#*", "cvslog.*", ",*", "CVS", "CVS.adm", ".del-*", "*.a", "*.olb", "*.o", "*.obj",
    "*.so", "*.Z", "*~", "*.old", "*.elc", "*.ln", "*.bak", "*.BAK", "*.orig", "*.rej", "*.exe",
    "_$*", "*$",
];

#[derive(Debug, Clone)]
enum IgnorePattern {
    Literal(String),
    Glob(Pattern),
}

impl IgnorePattern {
    fn new(pat: &str) -> Option<Self> {
        if pat.contains(['*', '?', '[']) {
            match Pattern::new(pat) {
                Ok(p) => Some(IgnorePattern::Glob(p)),
                Err(e) => {
                    tracing::warn!("Ignoring invalid pattern '{}': {}", pat, e);
                    None
                }
            }
        } else {
            Some(IgnorePattern::Literal(pat.to_string()))
        }
    }

    fn matches(&self, name: &str) -> bool {
        match self {
            IgnorePattern::Literal(s) => s == name,
            IgnorePattern::Glob(p) => p.matches(name),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct IgnoreSet {
    patterns: Vec<IgnorePattern>,
}

impl IgnoreSet {
    /// An empty set (nothing ignored).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_defaults() -> Self {
        let mut set = Self::empty();
        for pat in DEFAULT_IGNORES {
            set.push(pat);
        }
        set
    }

    /// Defaults plus `~/.cvsignore` and `$CVSIGNORE`.
    pub fn for_user() -> Self {
        let mut set = Self::with_defaults();
        if let Some(home) = dirs::home_dir() {
            set.add_file(&home.join(USER_IGNORE_FILE));
        }
        if let Ok(env) = std::env::var(IGNORE_ENV) {
            set.add_line(&env);
        }
        set
    }

    fn push(&mut self, pat: &str) {
        if let Some(p) = IgnorePattern::new(pat) {
            self.patterns.push(p);
        }
    }

    /// Add whitespace-separated patterns; `!` clears the set.
    pub fn add_line(&mut self, line: &str) {
        for pat in line.split_whitespace() {
            if pat == "!" {
                self.patterns.clear();
            } else {
                self.push(pat);
            }
        }
    }

    /// Add patterns from a file; a missing file adds nothing.
    pub fn add_file(&mut self, path: &Path) {
        match fs::read_to_string(path) {
            Ok(contents) => {
                for line in contents.lines() {
                    self.add_line(line);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!("Cannot read {}: {}", path.display(), e),
        }
    }

    /// The set in effect inside `dir`: this set plus `dir/.cvsignore`.
    pub fn for_dir(&self, dir: &Path) -> Self {
        let mut set = self.clone();
        set.add_file(&dir.join(USER_IGNORE_FILE));
        set
    }

    pub fn is_ignored(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.matches(name))
    }

    pub fn len(&self) -> usize {
        self.patterns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let set = IgnoreSet::with_defaults();
        assert!(set.is_ignored("main.o"));
        assert!(set.is_ignored("core"));
        assert!(set.is_ignored("CVS"));
        assert!(set.is_ignored("notes.bak"));
        assert!(set.is_ignored("file~"));
        assert!(!set.is_ignored("main.c"));
        assert!(!set.is_ignored("corefile"));
    }

    #[test]
    fn test_bang_clears() {
        let mut set = IgnoreSet::with_defaults();
        set.add_line("! *.tmp");
        assert!(!set.is_ignored("main.o"));
        assert!(set.is_ignored("x.tmp"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_per_dir_file() {
        let tmp = TempDir::new().unwrap();
        fs::write(tmp.path().join(".cvsignore"), "build\n*.log\n").unwrap();
        let base = IgnoreSet::empty();
        let set = base.for_dir(tmp.path());
        assert!(set.is_ignored("build"));
        assert!(set.is_ignored("run.log"));
        assert!(!base.is_ignored("build"));
    }
}

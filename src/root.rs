//! Repository root specifications (`CVSROOT`).
//!
//! ```text
//! /path                          local
//! :local:/path                   local
//! :fork:/path                    local, through a server subprocess
//! [user@]host:/path              ext
//! :ext:[user@]host[:port]:/path  ext (remote shell from CVS_RSH)
//! :daemon:[user@]host[:port]/path  TCP to an rcvs daemon
//! ```

use crate::admin;
use crate::config::DEFAULT_PORT;
use crate::error::{CvsError, Result};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

pub const ROOT_ENV: &str = "CVSROOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Local,
    Fork,
    Ext,
    Daemon,
}

impl Method {
    fn name(&self) -> &'static str {
        match self {
            Method::Local => "local",
            Method::Fork => "fork",
            Method::Ext => "ext",
            Method::Daemon => "daemon",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CvsRoot {
    pub method: Method,
    pub user: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Absolute repository path on the server.
    pub path: String,
}

impl CvsRoot {
    pub fn local(path: &str) -> Self {
        Self {
            method: Method::Local,
            user: None,
            host: None,
            port: None,
            path: path.trim_end_matches('/').to_string(),
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.method, Method::Ext | Method::Daemon)
    }

    pub fn port_or_default(&self) -> u16 {
        self.port.unwrap_or(DEFAULT_PORT)
    }

    /// The root from `-d`, else the working directory's `CVS/Root`, else
    /// `$CVSROOT`.
    pub fn resolve(flag: Option<&str>, dir: &Path) -> Result<Self> {
        if let Some(spec) = flag {
            return spec.parse();
        }
        if let Some(spec) = admin::read_root(dir)? {
            return spec.parse();
        }
        match std::env::var(ROOT_ENV) {
            Ok(spec) if !spec.is_empty() => spec.parse(),
            _ => Err(CvsError::NoRoot),
        }
    }
}

fn bad(spec: &str, why: &str) -> CvsError {
    CvsError::Config(format!("bad root `{}': {}", spec, why))
}

/// Split `[user@]host[:port]` off the front of `rest`, leaving the path.
fn parse_remote(spec: &str, method: Method, rest: &str) -> Result<CvsRoot> {
    let slash = rest.find('/').ok_or_else(|| bad(spec, "missing repository path"))?;
    let (head, path) = rest.split_at(slash);
    let head = head.strip_suffix(':').unwrap_or(head);
    let (user, hostport) = match head.split_once('@') {
        Some((u, h)) => (Some(u.to_string()), h),
        None => (None, head),
    };
    let (host, port) = match hostport.split_once(':') {
        Some((h, p)) => {
            let port = p.parse::<u16>().map_err(|_| bad(spec, "bad port"))?;
            (h, Some(port))
        }
        None => (hostport, None),
    };
    if host.is_empty() {
        return Err(bad(spec, "missing host"));
    }
    Ok(CvsRoot {
        method,
        user,
        host: Some(host.to_string()),
        port,
        path: path.trim_end_matches('/').to_string(),
    })
}

impl FromStr for CvsRoot {
    type Err = CvsError;

    fn from_str(spec: &str) -> Result<Self> {
        let spec = spec.trim();
        if let Some(rest) = spec.strip_prefix(':') {
            let (method, rest) = rest
                .split_once(':')
                .ok_or_else(|| bad(spec, "unterminated method"))?;
            return match method {
                "local" | "fork" => {
                    if !rest.starts_with('/') {
                        return Err(bad(spec, "path must be absolute"));
                    }
                    let mut root = CvsRoot::local(rest);
                    if method == "fork" {
                        root.method = Method::Fork;
                    }
                    Ok(root)
                }
                "ext" | "server" => parse_remote(spec, Method::Ext, rest),
                "daemon" => parse_remote(spec, Method::Daemon, rest),
                other => Err(bad(spec, &format!("unknown method `{}'", other))),
            };
        }
        if spec.starts_with('/') {
            return Ok(CvsRoot::local(spec));
        }
        if spec.contains(':') {
            return parse_remote(spec, Method::Ext, spec);
        }
        Err(bad(spec, "not an absolute path or host:path"))
    }
}

impl fmt::Display for CvsRoot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, ":{}:", self.method.name())?;
        if let Some(host) = &self.host {
            if let Some(user) = &self.user {
                write!(f, "{}@", user)?;
            }
            f.write_str(host)?;
            if let Some(port) = self.port {
                write!(f, ":{}", port)?;
            }
            if self.method == Method::Ext {
                f.write_str(":")?;
            }
        }
        f.write_str(&self.path)
    }
}

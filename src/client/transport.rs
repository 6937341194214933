//! Connection to a server - a `rcvs server` subprocess (local or over a
//! remote shell) or a TCP connection to `rcvs daemon`.

use crate::protocol::Connection;
use crate::root::{CvsRoot, Method};
use anyhow::{Context, Result};
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::process::{Child, Command};

/// Remote shell for `:ext:` roots.
pub const RSH_ENV: &str = "CVS_RSH";

pub type Reader = Box<dyn AsyncRead + Unpin + Send>;
pub type Writer = Box<dyn AsyncWrite + Unpin + Send>;

/// An open protocol connection and the process behind it, if any.
pub struct Link {
    pub conn: Connection<Reader, Writer>,
    child: Option<Child>,
}

fn spawn(mut cmd: Command) -> Result<Link> {
    cmd.stdin(Stdio::piped());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::inherit());
    cmd.kill_on_drop(true);

    let mut child = cmd.spawn().context("Failed to spawn server process")?;
    let stdin = child.stdin.take().context("Failed to open stdin")?;
    let stdout = child.stdout.take().context("Failed to open stdout")?;

    Ok(Link {
        conn: Connection::new(Box::new(stdout), Box::new(stdin)),
        child: Some(child),
    })
}

impl Link {
    /// Connect to the server for `root`.
    pub async fn open(root: &CvsRoot) -> Result<Self> {
        match root.method {
            Method::Local | Method::Fork => Self::connect_local(&root.path),
            Method::Ext => Self::connect_ext(root),
            Method::Daemon => Self::connect_daemon(root).await,
        }
    }

    /// Run `rcvs server <path>` on another host through the remote shell.
    pub fn connect_ext(root: &CvsRoot) -> Result<Self> {
        let rsh = std::env::var(RSH_ENV).unwrap_or_else(|_| "ssh".to_string());
        let host = root.host.as_deref().context("ext root has no host")?;
        let mut cmd = Command::new(&rsh);

        if let Some(user) = &root.user {
            cmd.arg("-l").arg(user);
        }
        if let Some(port) = root.port {
            cmd.arg("-p").arg(port.to_string());
        }
        cmd.arg(host);

        // Remote command: rcvs server <path>
        cmd.arg("rcvs");
        cmd.arg("server");
        cmd.arg(&root.path);

        tracing::debug!("Connecting to {} via {}", host, rsh);
        spawn(cmd)
    }

    /// Run this executable as a server subprocess.
    pub fn connect_local(path: &str) -> Result<Self> {
        let exe = std::env::current_exe().context("Cannot locate own executable")?;
        let mut cmd = Command::new(exe);
        cmd.arg("server");
        cmd.arg(path);
        spawn(cmd)
    }

    pub async fn connect_daemon(root: &CvsRoot) -> Result<Self> {
        let host = root.host.as_deref().context("daemon root has no host")?;
        let addr = format!("{}:{}", host, root.port_or_default());
        let stream = TcpStream::connect(&addr)
            .await
            .with_context(|| format!("Failed to connect to {}", addr))?;
        stream.set_nodelay(true)?;
        let (r, w) = stream.into_split();
        tracing::debug!("Connected to daemon at {}", addr);
        Ok(Link {
            conn: Connection::new(Box::new(r), Box::new(w)),
            child: None,
        })
    }

    /// Wrap an existing stream pair (tests, embedding).
    pub fn from_streams(reader: Reader, writer: Writer) -> Self {
        Link {
            conn: Connection::new(reader, writer),
            child: None,
        }
    }

    /// Close the connection and wait for the server process to exit.
    pub async fn close(self) -> Result<()> {
        let Link { conn, child } = self;
        drop(conn);
        if let Some(mut child) = child {
            let status = child.wait().await.context("Failed to wait for server")?;
            if !status.success() {
                tracing::debug!("Server process exited with {}", status);
            }
        }
        Ok(())
    }
}

//! Request emission: describe a working copy to the server.

use crate::admin;
use crate::entries::{Entries, EntryKind, OpenMode, ADMIN_DIR};
use crate::error::{CvsError, Result};
use crate::protocol::{valid_responses, Connection};
use crate::worktree::{FileStatus, NodeId, WorkingTree};
use std::fs;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncWrite};

/// What to send for locally changed files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Contents {
    /// `Modified` with the file payload.
    Send,
    /// `Is-modified` only.
    Claim,
}

/// `Root`, `Valid-responses` and `valid-requests`. The server answers the
/// last one with `Valid-requests` and `ok`.
pub async fn send_preamble<R, W>(conn: &mut Connection<R, W>, root_path: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    conn.write_line(&format!("Root {}", root_path)).await?;
    conn.write_line(&format!("Valid-responses {}", valid_responses()))
        .await?;
    conn.write_line("valid-requests").await?;
    conn.flush().await
}

pub async fn send_global_options<R, W>(conn: &mut Connection<R, W>, options: &[&str]) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for opt in options {
        conn.write_line(&format!("Global_option {}", opt)).await?;
    }
    Ok(())
}

/// Absolute repository path of a working directory.
fn remote_dir(root_path: &str, repository: &str) -> String {
    if repository.starts_with('/') {
        repository.to_string()
    } else if repository == "." {
        root_path.to_string()
    } else {
        format!("{}/{}", root_path, repository)
    }
}

fn local_name(tree: &WorkingTree, id: NodeId) -> String {
    tree.path(id).to_string_lossy().into_owned()
}

/// Send `Directory` plus per-file requests for every tracked directory in
/// `tree`. Untracked subdirectories are sent as `Questionable`.
pub async fn send_working_tree<R, W>(
    conn: &mut Connection<R, W>,
    tree: &WorkingTree,
    root_path: &str,
    contents: Contents,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for dir in tree.dirs() {
        let full = tree.full_path(dir);
        let Some(repository) = admin::read_repository(&full)? else {
            continue;
        };
        conn.write_line(&format!("Directory {}", local_name(tree, dir)))
            .await?;
        conn.write_line(&remote_dir(root_path, &repository)).await?;
        if let Some(tag) = admin::read_tag(&full)? {
            conn.write_line(&format!("Sticky {}", tag)).await?;
        }
        if full.join(ADMIN_DIR).join("Entries.Static").is_file() {
            conn.write_line("Static-directory").await?;
        }

        let entries = Entries::open(&full, OpenMode::Read)?;
        for entry in entries.iter().filter(|e| e.kind == EntryKind::File) {
            conn.write_line(&format!("Entry {}", entry)).await?;
        }
        drop(entries);

        for &child in tree.node(dir).children() {
            let node = tree.node(child);
            if node.is_dir() {
                if !admin::is_admin_dir(&tree.full_path(child)) {
                    conn.write_line(&format!("Questionable {}", node.name)).await?;
                }
                continue;
            }
            match node.status {
                FileStatus::UpToDate | FileStatus::Conflict => {
                    conn.write_line(&format!("Unchanged {}", node.name)).await?;
                }
                FileStatus::Modified | FileStatus::Added if node.mtime.is_some() => match contents {
                    Contents::Send => {
                        let path = tree.full_path(child);
                        let data = fs::read(&path).map_err(|e| CvsError::io_at(&path, e))?;
                        if !node.keyword_mode.is_empty() {
                            conn.write_line(&format!("Kopt {}", node.keyword_mode)).await?;
                        }
                        conn.write_line(&format!("Modified {}", node.name)).await?;
                        conn.send_file(node.mode, &data).await?;
                    }
                    Contents::Claim => {
                        conn.write_line(&format!("Is-modified {}", node.name)).await?;
                    }
                },
                FileStatus::Unknown => {
                    conn.write_line(&format!("Questionable {}", node.name)).await?;
                }
                // Removed, Lost, or added but missing: the entry says it all.
                _ => {}
            }
        }
    }
    Ok(())
}

/// `Argument` lines; embedded newlines continue with `Argumentx`.
pub async fn send_arguments<R, W>(conn: &mut Connection<R, W>, args: &[String]) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    for arg in args {
        let mut lines = arg.split('\n');
        conn.write_line(&format!("Argument {}", lines.next().unwrap_or_default()))
            .await?;
        for more in lines {
            conn.write_line(&format!("Argumentx {}", more)).await?;
        }
    }
    Ok(())
}

/// The terminal command request.
pub async fn send_command<R, W>(conn: &mut Connection<R, W>, name: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    conn.write_line(name).await?;
    conn.flush().await
}

/// Directory the client sends first when it has no working copy (checkout).
pub async fn send_top_directory<R, W>(conn: &mut Connection<R, W>, root_path: &str) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    conn.write_line("Directory .").await?;
    conn.write_line(root_path).await
}

/// Whether `dir` is the top of a working copy we can run commands in.
pub fn is_working_dir(dir: &Path) -> bool {
    admin::is_admin_dir(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worktree::{scan, ScanFlags, ScanOptions};
    use tempfile::TempDir;
    use tokio::io::AsyncReadExt;

    async fn wire_of(tree: &WorkingTree, contents: Contents) -> String {
        let (mut rx, tx) = tokio::io::duplex(64 * 1024);
        let mut conn = Connection::new(tokio::io::empty(), tx);
        send_working_tree(&mut conn, tree, "/repo", contents).await.unwrap();
        send_arguments(&mut conn, &["-m".to_string(), "two\nlines".to_string()])
            .await
            .unwrap();
        send_command(&mut conn, "commit").await.unwrap();
        drop(conn);
        let mut out = String::new();
        rx.read_to_string(&mut out).await.unwrap();
        out
    }

    fn working_copy() -> TempDir {
        let tmp = TempDir::new().unwrap();
        admin::create_admin_dir(tmp.path(), ":local:/repo", "mod", None).unwrap();
        fs::write(tmp.path().join("same"), "s").unwrap();
        fs::write(tmp.path().join("changed"), "new").unwrap();
        fs::write(tmp.path().join("stray"), "?").unwrap();
        fs::create_dir(tmp.path().join("junkdir")).unwrap();

        let mtime = crate::timestamp::mtime_secs(&fs::metadata(tmp.path().join("same")).unwrap());
        let mut entries = Entries::open(tmp.path(), OpenMode::Write).unwrap();
        entries.add(crate::entries::EntryRecord::file(
            "same",
            "1.1",
            crate::entries::EntryTimestamp::At(mtime),
        ));
        entries.add(crate::entries::EntryRecord::file(
            "changed",
            "1.1",
            crate::entries::EntryTimestamp::At(0),
        ));
        entries.close().unwrap();
        tmp
    }

    #[tokio::test]
    async fn test_sends_claims_for_each_status() {
        let tmp = working_copy();
        let tree = scan(tmp.path(), &ScanOptions::new(ScanFlags::default() - ScanFlags::APPLY_IGNORE)).unwrap();
        let wire = wire_of(&tree, Contents::Send).await;

        assert!(wire.starts_with("Directory .\n/repo/mod\n"));
        assert!(wire.contains("Entry /same/1.1/"));
        assert!(wire.contains("Unchanged same\n"));
        assert!(wire.contains("Modified changed\n"));
        assert!(wire.contains("\n3\nnew"));
        assert!(wire.contains("Questionable stray\n"));
        assert!(wire.contains("Questionable junkdir\n"));
        assert!(wire.ends_with("Argument -m\nArgument two\nArgumentx lines\ncommit\n"));
    }

    #[tokio::test]
    async fn test_claim_only_mode() {
        let tmp = working_copy();
        let tree = scan(tmp.path(), &ScanOptions::new(ScanFlags::default() - ScanFlags::APPLY_IGNORE)).unwrap();
        let wire = wire_of(&tree, Contents::Claim).await;
        assert!(wire.contains("Is-modified changed\n"));
        assert!(!wire.contains("Modified changed\n3"));
    }
}

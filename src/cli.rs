use clap::{Args, Parser, Subcommand};
use rcvs::config::DaemonOverrides;
use std::path::PathBuf;

/// CVS-compatible client, server and daemon.
///
/// Global options go before the command, command options after it:
/// `rcvs -d :ext:host:/cvs -q update -d`.
#[derive(Parser, Debug)]
#[command(name = "rcvs", version, about, long_about = None)]
pub struct Cli {
    /// Repository root (overrides CVS/Root and $CVSROOT)
    #[arg(short = 'd', value_name = "CVSROOT")]
    pub root: Option<String>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Somewhat quiet: suppress informational messages
    #[arg(short = 'q')]
    pub quiet: bool,

    /// Really quiet: only errors
    #[arg(short = 'Q')]
    pub really_quiet: bool,

    /// Report what would happen without changing any files
    #[arg(short = 'n')]
    pub noop: bool,

    /// Make checked-out files read-only
    #[arg(short = 'r')]
    pub read_only: bool,

    #[command(subcommand)]
    pub command: Command,
}

impl Cli {
    /// `Global_option` flags for the server.
    pub fn global_options(&self) -> Vec<String> {
        let mut opts = Vec::new();
        if self.really_quiet {
            opts.push("-Q".to_string());
        } else if self.quiet {
            opts.push("-q".to_string());
        }
        if self.noop {
            opts.push("-n".to_string());
        }
        if self.read_only {
            opts.push("-r".to_string());
        }
        opts
    }
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Check out modules into the current directory
    #[command(visible_alias = "co")]
    Checkout(CheckoutArgs),

    /// Bring the working copy up to date with the repository
    #[command(visible_alias = "up")]
    Update(UpdateArgs),

    /// Store local changes in the repository
    #[command(visible_alias = "ci")]
    Commit(CommitArgs),

    /// Show differences between the working copy and the repository
    Diff(DiffArgs),

    /// Schedule files or directories for addition
    Add(AddArgs),

    /// Schedule removed files for deletion from the repository
    #[command(visible_alias = "rm")]
    Remove(FileArgs),

    /// Show the status of working files
    #[command(visible_alias = "st")]
    Status(FileArgs),

    /// Show revision history (forwarded to the server)
    Log(PassArgs),
    /// Show repository history (forwarded to the server)
    History(PassArgs),
    /// Tag revisions (forwarded to the server)
    Tag(PassArgs),
    /// Administer RCS files (forwarded to the server)
    Admin(PassArgs),
    /// Announce an edit (forwarded to the server)
    Edit(PassArgs),
    /// Withdraw an edit (forwarded to the server)
    Unedit(PassArgs),
    /// Turn watches on or off (forwarded to the server)
    Watch(WatchArgs),

    /// Serve one client over stdin/stdout
    Server(ServerArgs),

    /// Accept TCP clients and serve them from a worker pool
    Daemon(DaemonArgs),

    /// Daemon worker process (started by the daemon)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        id: u32,
    },
}

#[derive(Args, Debug, Clone, Default)]
pub struct Recursion {
    /// Local: this directory only
    #[arg(short = 'l', conflicts_with = "recursive")]
    pub local: bool,

    /// Recurse into subdirectories (default)
    #[arg(short = 'R')]
    pub recursive: bool,
}

#[derive(Args, Debug, Clone, Default)]
pub struct Selection {
    /// Revision or tag
    #[arg(short = 'r', value_name = "REV")]
    pub revision: Option<String>,

    /// Date
    #[arg(short = 'D', value_name = "DATE")]
    pub date: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct Message {
    /// Log message
    #[arg(short = 'm', value_name = "MSG", conflicts_with = "file")]
    pub message: Option<String>,

    /// Read the log message from a file
    #[arg(short = 'F', value_name = "FILE")]
    pub file: Option<PathBuf>,
}

#[derive(Args, Debug)]
pub struct CheckoutArgs {
    #[command(flatten)]
    pub recursion: Recursion,
    #[command(flatten)]
    pub selection: Selection,
    #[arg(required = true, value_name = "MODULE")]
    pub modules: Vec<String>,
}

#[derive(Args, Debug)]
pub struct UpdateArgs {
    #[command(flatten)]
    pub recursion: Recursion,
    #[command(flatten)]
    pub selection: Selection,
    /// Create directories that exist in the repository
    #[arg(short = 'd')]
    pub create_dirs: bool,
    pub files: Vec<String>,
}

#[derive(Args, Debug)]
pub struct CommitArgs {
    #[command(flatten)]
    pub recursion: Recursion,
    #[command(flatten)]
    pub message: Message,
    pub files: Vec<String>,
}

#[derive(Args, Debug)]
pub struct DiffArgs {
    #[command(flatten)]
    pub recursion: Recursion,
    #[command(flatten)]
    pub selection: Selection,
    pub files: Vec<String>,
}

#[derive(Args, Debug)]
pub struct AddArgs {
    #[command(flatten)]
    pub message: Message,
    #[arg(required = true)]
    pub files: Vec<String>,
}

#[derive(Args, Debug)]
pub struct FileArgs {
    #[command(flatten)]
    pub recursion: Recursion,
    pub files: Vec<String>,
}

#[derive(Args, Debug)]
pub struct PassArgs {
    /// Arguments passed to the server unchanged
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub args: Vec<String>,
}

#[derive(Args, Debug)]
pub struct WatchArgs {
    #[arg(value_parser = ["on", "off"])]
    pub mode: String,
    pub files: Vec<String>,
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    /// Repository this server serves
    pub repository: PathBuf,

    /// Log repository entries with unexpected ownership or modes
    #[arg(long)]
    pub check_permissions: bool,

    /// Seconds a lock request may wait (default: forever)
    #[arg(long, value_name = "SECS")]
    pub lock_timeout: Option<u64>,
}

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Configuration file (default: /etc/rcvsd.toml if present)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, value_name = "ADDR")]
    pub listen: Option<String>,

    /// Repository root
    #[arg(long, value_name = "DIR")]
    pub repository: Option<PathBuf>,

    /// Maximum number of worker processes
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,

    /// Account workers switch to
    #[arg(long)]
    pub user: Option<String>,

    #[arg(long)]
    pub group: Option<String>,

    /// Do not chroot workers into the repository
    #[arg(long)]
    pub no_chroot: bool,

    #[arg(long)]
    pub check_permissions: bool,

    #[arg(long, value_name = "SECS")]
    pub lock_timeout: Option<u64>,
}

impl DaemonArgs {
    pub fn overrides(&self) -> DaemonOverrides {
        DaemonOverrides {
            listen: self.listen.clone(),
            repository: self.repository.clone(),
            max_workers: self.max_workers,
            user: self.user.clone(),
            group: self.group.clone(),
            no_chroot: self.no_chroot,
            check_permissions: self.check_permissions,
            lock_timeout_secs: self.lock_timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_and_command_flags_do_not_clash() {
        let cli = Cli::try_parse_from(["rcvs", "-d", "/cvs", "-q", "update", "-d", "-r", "1.2", "foo"]).unwrap();
        assert_eq!(cli.root.as_deref(), Some("/cvs"));
        assert_eq!(cli.global_options(), vec!["-q".to_string()]);
        match cli.command {
            Command::Update(args) => {
                assert!(args.create_dirs);
                assert_eq!(args.selection.revision.as_deref(), Some("1.2"));
                assert_eq!(args.files, vec!["foo".to_string()]);
            }
            other => panic!("parsed {:?}", other),
        }
    }

    #[test]
    fn test_aliases_and_conflicts() {
        assert!(matches!(
            Cli::try_parse_from(["rcvs", "ci", "-m", "msg"]).unwrap().command,
            Command::Commit(_)
        ));
        assert!(Cli::try_parse_from(["rcvs", "update", "-l", "-R"]).is_err());
        assert!(Cli::try_parse_from(["rcvs", "commit", "-m", "x", "-F", "f"]).is_err());
        assert!(Cli::try_parse_from(["rcvs", "watch", "maybe"]).is_err());
    }

    #[test]
    fn test_pass_through_keeps_flags() {
        let cli = Cli::try_parse_from(["rcvs", "log", "-b", "foo"]).unwrap();
        match cli.command {
            Command::Log(pass) => assert_eq!(pass.args, vec!["-b".to_string(), "foo".to_string()]),
            other => panic!("parsed {:?}", other),
        }
    }
}

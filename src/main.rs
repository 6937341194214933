mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use cli::{Cli, Command, Message, Recursion, Selection};
use colored::Colorize;
use rcvs::client::{self, ClientOptions, CommandRequest, Completion, Outcome};
use rcvs::config::DaemonConfig;
use rcvs::error::CvsError;
use rcvs::server::{self, ServerOptions};
use std::process::ExitCode;
use std::time::Duration;

/// Exit status when no repository root is configured.
const EXIT_NO_ROOT: u8 = 2;

fn push_recursion(args: &mut Vec<String>, r: &Recursion) {
    if r.local {
        args.push("-l".to_string());
    }
}

fn push_selection(args: &mut Vec<String>, s: &Selection) {
    if let Some(rev) = &s.revision {
        args.push("-r".to_string());
        args.push(rev.clone());
    }
    if let Some(date) = &s.date {
        args.push("-D".to_string());
        args.push(date.clone());
    }
}

fn push_message(args: &mut Vec<String>, m: &Message) -> Result<()> {
    let text = match (&m.message, &m.file) {
        (Some(text), _) => Some(text.clone()),
        (None, Some(path)) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("Cannot read log message from {}", path.display()))?,
        ),
        (None, None) => None,
    };
    if let Some(text) = text {
        args.push("-m".to_string());
        args.push(text);
    }
    Ok(())
}

fn request(name: &str, args: Vec<String>, local: bool) -> CommandRequest {
    let mut req = CommandRequest::new(name, args);
    req.recurse = !local;
    req
}

/// Translate a client subcommand into the request sent to the server.
fn build_request(command: Command) -> Result<CommandRequest> {
    let mut args = Vec::new();
    let req = match command {
        Command::Checkout(a) => {
            push_recursion(&mut args, &a.recursion);
            push_selection(&mut args, &a.selection);
            args.extend(a.modules);
            request("checkout", args, a.recursion.local)
        }
        Command::Update(a) => {
            push_recursion(&mut args, &a.recursion);
            if a.create_dirs {
                args.push("-d".to_string());
            }
            push_selection(&mut args, &a.selection);
            args.extend(a.files);
            request("update", args, a.recursion.local)
        }
        Command::Commit(a) => {
            push_recursion(&mut args, &a.recursion);
            push_message(&mut args, &a.message)?;
            args.extend(a.files);
            request("commit", args, a.recursion.local)
        }
        Command::Diff(a) => {
            push_recursion(&mut args, &a.recursion);
            push_selection(&mut args, &a.selection);
            args.extend(a.files);
            request("diff", args, a.recursion.local)
        }
        Command::Add(a) => {
            push_message(&mut args, &a.message)?;
            args.extend(a.files);
            request("add", args, true)
        }
        Command::Remove(a) => {
            push_recursion(&mut args, &a.recursion);
            args.extend(a.files);
            request("remove", args, a.recursion.local)
        }
        Command::Status(a) => {
            push_recursion(&mut args, &a.recursion);
            args.extend(a.files);
            request("status", args, a.recursion.local)
        }
        Command::Log(p) => pass_through("log", p.args),
        Command::History(p) => pass_through("history", p.args),
        Command::Tag(p) => pass_through("tag", p.args),
        Command::Admin(p) => pass_through("admin", p.args),
        Command::Edit(p) => pass_through("edit", p.args),
        Command::Unedit(p) => pass_through("unedit", p.args),
        Command::Watch(w) => {
            let name = if w.mode == "on" { "watch-on" } else { "watch-off" };
            request(name, w.files, false)
        }
        Command::Server(_) | Command::Daemon(_) | Command::Worker { .. } => {
            anyhow::bail!("not a client command")
        }
    };
    Ok(req)
}

fn pass_through(name: &str, args: Vec<String>) -> CommandRequest {
    let local = args.iter().any(|a| a == "-l");
    request(name, args, local)
}

fn report(name: &str, outcome: &Outcome) -> ExitCode {
    for failure in &outcome.failures {
        eprintln!("{} {}: {}", "rcvs:".red().bold(), failure.path.display(), failure.message);
    }
    if let Completion::Error(msg) = &outcome.completion {
        if msg.is_empty() {
            eprintln!("{} {} failed", "rcvs:".red().bold(), name);
        } else {
            eprintln!("{} [{} aborted]: {}", "rcvs:".red().bold(), name, msg);
        }
    }
    if outcome.success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let global = cli.global_options();
    match cli.command {
        Command::Server(args) => {
            let opts = ServerOptions {
                check_permissions: args.check_permissions,
                lock_timeout: args.lock_timeout.filter(|s| *s > 0).map(Duration::from_secs),
            };
            server::run_server(&args.repository, opts).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Daemon(args) => {
            let mut config = DaemonConfig::load(args.config.as_deref())?;
            config.apply(args.overrides());
            rcvs::daemon::run_daemon(config, cli.verbose).await?;
            Ok(ExitCode::SUCCESS)
        }
        command => {
            let req = build_request(command)?;
            let name = req.name.clone();
            let opts = ClientOptions {
                root: cli.root,
                global,
                capture: false,
            };
            let dir = std::env::current_dir().context("Cannot determine current directory")?;
            let outcome = client::run_command(&dir, &opts, &req).await?;
            Ok(report(&name, &outcome))
        }
    }
}

fn exit_for_error(e: &anyhow::Error) -> ExitCode {
    eprintln!("{} {:#}", "rcvs:".red().bold(), e);
    match e.downcast_ref::<CvsError>() {
        Some(CvsError::NoRoot) => ExitCode::from(EXIT_NO_ROOT),
        _ => ExitCode::FAILURE,
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    rcvs::logging::init(cli.verbose, cli.really_quiet);

    // Workers build their own single-threaded runtime after dropping
    // privileges.
    if let Command::Worker { id } = cli.command {
        return match rcvs::daemon::run_worker(id) {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => exit_for_error(&e),
        };
    }

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => return exit_for_error(&anyhow::Error::from(e).context("Failed to start runtime")),
    };
    match runtime.block_on(run(cli)) {
        Ok(code) => code,
        Err(e) => exit_for_error(&e),
    }
}

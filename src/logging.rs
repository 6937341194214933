//! Tracing subscriber setup.
//!
//! Logs always go to stderr: in server mode stdout carries the protocol.

use tracing::metadata::LevelFilter;
use tracing_subscriber::EnvFilter;

fn level_from_verbosity(verbosity: u8, quiet: bool) -> LevelFilter {
    if quiet {
        return LevelFilter::ERROR;
    }
    match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the verbosity.
pub fn init(verbosity: u8, quiet: bool) {
    let filter = EnvFilter::builder()
        .with_default_directive(level_from_verbosity(verbosity, quiet).into())
        .from_env_lossy();

    let installed = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
    if installed.is_err() {
        tracing::debug!("Subscriber already installed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels() {
        assert_eq!(level_from_verbosity(0, false), LevelFilter::WARN);
        assert_eq!(level_from_verbosity(2, false), LevelFilter::DEBUG);
        assert_eq!(level_from_verbosity(9, false), LevelFilter::TRACE);
        assert_eq!(level_from_verbosity(3, true), LevelFilter::ERROR);
    }
}

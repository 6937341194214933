//! rcvs: a CVS-compatible client/server protocol engine.
//!
//! The client scans a working copy ([`worktree`]), describes it to a server
//! as protocol requests ([`client::requests`]) and applies the responses to
//! the working copy ([`client::responses`]). The server side interprets
//! requests against a repository ([`server`], [`repo`]), either for one
//! client over stdio or, through the [`daemon`], for many TCP clients served
//! by a pool of confined worker processes.

pub mod admin;
pub mod client;
pub mod config;
pub mod daemon;
pub mod entries;
pub mod error;
pub mod logging;
pub mod protocol;
pub mod repo;
pub mod root;
pub mod server;
pub mod timestamp;
pub mod worktree;

pub use error::{CvsError, Result};

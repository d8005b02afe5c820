//! Scoped SSH sessions and channels over `russh`.
//!
//! Every connection this crate opens is closed before the scope that opened
//! it returns, on success, on error, and on panic. The layers build on each
//! other:
//!
//! 1. [`ssh::Ssh`] holds identities and the known hosts file, and creates
//!    sessions.
//! 2. [`ssh::with_session`] connects a [`ssh::Session`], runs an operation, and
//!    disconnects.
//! 3. [`ssh::with_channel`] does the same for a channel opened on that session.
//! 4. [`ssh::execute_remote_as_string`] and friends compose both to run one
//!    command.
//!
//! ```ignore
//! use ssh_scope::ssh::{ConnectionParams, execute_remote_as_string};
//!
//! let params = ConnectionParams::new("10.0.0.5", "deploy").password("secret");
//! let uptime = execute_remote_as_string("uptime", &params).await?;
//! ```
//!
//! The library never installs a `tracing` subscriber; lifecycle events are
//! emitted at `info` and `debug`.

#![cfg_attr(not(test), deny(clippy::unwrap_used))]

pub mod ssh;

pub use ssh::{ConnectionParams, Error, Result};

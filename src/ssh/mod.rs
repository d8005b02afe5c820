//! SSH sessions, channels, and remote command execution.
//!
//! This module is organized into the following submodules:
//!
//! - `config`: Credential and property resolution with environment variable support
//! - `error`: Error type and retry classification
//! - `engine`: Identities, known hosts, and the session factory
//! - `handler`: russh client handler (host key policy, forwarded connections)
//! - `auth`: Authentication strategies and the ordered chain
//! - `session`: Session lifecycle and `with_session`
//! - `channel`: Channel lifecycle and `with_channel`
//! - `typed`: Typed channel wrappers
//! - `output`: Reading channel output
//! - `scope`: The shared connect, run, always-disconnect helper
//! - `exec`: One-shot remote command facade
//! - `retry`: Opt-in retry with backoff

pub(crate) mod auth;
pub mod channel;
pub mod config;
pub mod engine;
pub mod error;
pub mod exec;
pub(crate) mod handler;
pub mod output;
pub mod retry;
pub mod scope;
pub mod session;
pub mod typed;

pub use channel::{Channel, ChannelType, PtyRequest, X11Request, with_channel};
pub use config::{ConnectionParams, HostKeyPolicy, Properties};
pub use engine::{EngineOptions, Identity, Ssh};
pub use error::{Error, Result};
pub use exec::{
    CommandOutput, execute_remote, execute_remote_as_string, execute_remote_cancellable,
    execute_remote_output,
};
pub use handler::ForwardedConnection;
pub use output::{ChannelOutput, LineReader, SharedBuffer};
pub use retry::{RetryPolicy, with_retry};
pub use scope::Connectable;
pub use session::{Session, SessionOptions, with_session};
pub use typed::{
    ChannelKind, DirectTcpIpChannel, ExecChannel, ForwardedTcpIpChannel, SftpChannel,
    ShellChannel, TypedChannel,
};

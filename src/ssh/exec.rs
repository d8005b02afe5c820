//! Run one remote command per call.
//!
//! Every function here builds an engine and a session from
//! [`ConnectionParams`], runs the command on an exec channel, and tears both
//! down before returning: the channel inside [`with_channel`], nested inside
//! [`with_session`]. Nothing is pooled.
//!
//! ```ignore
//! let params = ConnectionParams::new("10.0.0.5", "deploy").password("secret");
//!
//! let kernel = execute_remote_as_string("uname -r", &params).await?;
//!
//! let count = execute_remote("ls /etc", &params, async |mut lines| {
//!     let mut count = 0;
//!     let mut line = String::new();
//!     while lines.read_line(&mut line).await? > 0 {
//!         count += 1;
//!         line.clear();
//!     }
//!     Ok::<_, Error>(count)
//! })
//! .await?;
//! ```

use std::io::{self, Write};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::channel::with_channel;
use super::config::{ConnectionParams, require_non_blank};
use super::engine::Ssh;
use super::error::{Error, Result};
use super::output::{LineReader, SharedBuffer};
use super::session::with_session;
use super::typed::ExecChannel;

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    /// `None` when the server never reported one.
    pub exit_status: Option<u32>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_status == Some(0)
    }
}

async fn run_exec<T, E, F>(
    command: &str,
    params: &ConnectionParams,
    err_sink: Box<dyn Write + Send>,
    operation: F,
) -> std::result::Result<T, E>
where
    E: From<Error>,
    F: AsyncFnOnce(&mut ExecChannel<'_>) -> std::result::Result<T, E>,
{
    params.validate()?;
    require_non_blank("command", command)?;

    let ssh = Ssh::create(&params.engine_options(), |_| {});
    let mut session = ssh.create_session(params.session_options(), |_| {})?;
    let timeout = params.resolved_connect_timeout();
    info!(
        "Running remote command on {}@{}: {}",
        params.username,
        session.target(),
        command
    );

    with_session(&mut session, timeout, async move |session| {
        let mut channel = session
            .create_channel::<ExecChannel>()?
            .with_command(command)
            .with_err_stream(err_sink);
        with_channel(&mut channel, timeout, operation).await
    })
    .await
}

fn decode(bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes)
        .map_err(|e| Error::Stream(format!("remote output is not valid UTF-8: {}", e)))
}

/// Run `command` and hand `operation` a line reader over its stdout.
///
/// Remote stderr is copied to this process's stderr. The reader only lives
/// for the duration of `operation`.
pub async fn execute_remote<T, E, F>(
    command: &str,
    params: &ConnectionParams,
    operation: F,
) -> std::result::Result<T, E>
where
    E: From<Error>,
    F: AsyncFnOnce(LineReader<'_>) -> std::result::Result<T, E>,
{
    run_exec(command, params, Box::new(io::stderr()), async move |channel| {
        let lines = channel
            .lines()
            .ok_or_else(|| Error::ProtocolState("exec channel has no stdout".to_string()))?;
        operation(lines).await
    })
    .await
}

/// Run `command` and return its whole stdout.
///
/// Returns an empty string when the channel has no stdout. Output that is not
/// valid UTF-8 is a [`Error::Stream`].
pub async fn execute_remote_as_string(command: &str, params: &ConnectionParams) -> Result<String> {
    run_exec(command, params, Box::new(io::stderr()), async |channel| {
        let Some(mut stdout) = channel.stdout() else {
            return Ok(String::new());
        };
        let mut bytes = Vec::new();
        stdout.read_to_end(&mut bytes).await?;
        decode(bytes)
    })
    .await
}

/// Run `command` and capture stdout, stderr, and the exit status.
///
/// Stdout must be valid UTF-8; stderr is decoded lossily.
pub async fn execute_remote_output(
    command: &str,
    params: &ConnectionParams,
) -> Result<CommandOutput> {
    let stderr = SharedBuffer::new();

    let (stdout, exit_status) =
        run_exec::<_, Error, _>(command, params, Box::new(stderr.clone()), async |channel| {
            let mut bytes = Vec::new();
            if let Some(mut stdout) = channel.stdout() {
                stdout.read_to_end(&mut bytes).await?;
            }
            let exit_status = channel.finish().await?;
            Ok((bytes, exit_status))
        })
        .await?;

    Ok(CommandOutput {
        stdout: decode(stdout)?,
        stderr: String::from_utf8_lossy(&stderr.contents()).into_owned(),
        exit_status,
    })
}

/// [`execute_remote`] that gives up with [`Error::Cancelled`] once `token`
/// fires.
///
/// Cancellation is observed while `operation` runs; connecting is bounded by
/// the connect timeout instead. The channel and session are still
/// disconnected before this returns.
pub async fn execute_remote_cancellable<T, E, F>(
    command: &str,
    params: &ConnectionParams,
    token: &CancellationToken,
    operation: F,
) -> std::result::Result<T, E>
where
    E: From<Error>,
    F: AsyncFnOnce(LineReader<'_>) -> std::result::Result<T, E>,
{
    if token.is_cancelled() {
        return Err(Error::Cancelled.into());
    }

    execute_remote(command, params, async move |lines| {
        tokio::select! {
            result = operation(lines) => result,
            _ = token.cancelled() => {
                info!("Remote command cancelled: {}", command);
                Err(Error::Cancelled.into())
            }
        }
    })
    .await
}

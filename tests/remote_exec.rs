//! Live tests against the server named by `SSH_TEST_HOST`.

#[macro_use]
mod support;

use std::panic::AssertUnwindSafe;

use futures::FutureExt;
use ssh_scope::ssh::{
    Channel, ChannelKind, Error, ExecChannel, Session, Ssh, TypedChannel, execute_remote,
    execute_remote_as_string, execute_remote_output, with_channel, with_session,
};
use tokio::io::AsyncBufReadExt;

#[derive(Debug)]
enum AppError {
    Ssh(Error),
    Custom(&'static str),
}

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        AppError::Ssh(err)
    }
}

/// Test: `echo X` as a string.
/// Expected: output contains X.
#[tokio::test]
async fn echo_as_string() {
    let params = live_params_or_skip!();

    let output = execute_remote_as_string("echo X", &params)
        .await
        .expect("command should succeed");

    assert!(output.contains('X'), "unexpected output: {:?}", output);
}

/// Test: stream three lines through a line reader.
/// Expected: three non-blank lines.
#[tokio::test]
async fn printf_three_lines() {
    let params = live_params_or_skip!();

    let count = execute_remote("printf 'a\\nb\\nc\\n'", &params, async |reader| {
        let mut lines = reader.lines();
        let mut count = 0;
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                count += 1;
            }
        }
        Ok::<_, Error>(count)
    })
    .await
    .expect("command should succeed");

    assert_eq!(count, 3);
}

/// Test: capture stdout, stderr, and exit status separately.
/// Expected: each stream holds only its own text.
#[tokio::test]
async fn output_record() {
    let params = live_params_or_skip!();

    let output = execute_remote_output("echo out; echo err >&2; exit 3", &params)
        .await
        .expect("command should run");

    assert_eq!(output.stdout.trim(), "out");
    assert_eq!(output.stderr.trim(), "err");
    assert_eq!(output.exit_status, Some(3));
    assert!(!output.success());
}

/// Test: nested scopes with a successful operation.
/// Expected: both the channel and the session are disconnected afterwards.
#[tokio::test]
async fn nested_scopes_disconnect() {
    let params = live_params_or_skip!();
    let timeout = params.resolved_connect_timeout();

    let ssh = Ssh::create(&params.engine_options(), |_| {});
    let mut session = ssh
        .create_session(params.session_options(), |_| {})
        .expect("session should be created");

    let result: Result<String, AppError> =
        with_session(&mut session, timeout, async |session: &mut Session| {
            assert!(session.is_connected());
            assert!(session.connected_at().is_some());

            let mut channel = session
                .create_channel::<ExecChannel>()?
                .with_command("echo inside");
            let text = with_channel(&mut channel, timeout, async |channel| {
                let mut text = String::new();
                if let Some(mut lines) = channel.lines() {
                    lines.read_line(&mut text).await.map_err(Error::from)?;
                }
                Ok::<_, AppError>(text)
            })
            .await?;

            assert!(!channel.is_connected());
            Ok(text)
        })
        .await;

    assert_eq!(result.expect("scopes should succeed").trim(), "inside");
    assert!(!session.is_connected());
}

/// Test: an error raised inside the channel operation.
/// Expected: the caller sees that error, and everything is disconnected.
#[tokio::test]
async fn operation_error_propagates() {
    let params = live_params_or_skip!();
    let timeout = params.resolved_connect_timeout();

    let ssh = Ssh::create(&params.engine_options(), |_| {});
    let mut session = ssh
        .create_session(params.session_options(), |_| {})
        .expect("session should be created");

    let result: Result<(), AppError> =
        with_session(&mut session, timeout, async |session: &mut Session| {
            let mut channel = session
                .create_channel::<ExecChannel>()?
                .with_command("sleep 5");
            with_channel(&mut channel, timeout, async |_channel| {
                Err(AppError::Custom("rejected by caller"))
            })
            .await
        })
        .await;

    assert!(matches!(result, Err(AppError::Custom("rejected by caller"))));
    assert!(!session.is_connected());
}

/// Test: a panic inside the session operation.
/// Expected: the panic surfaces after the session is disconnected.
#[tokio::test]
async fn panic_disconnects_session() {
    let params = live_params_or_skip!();
    let timeout = params.resolved_connect_timeout();

    let ssh = Ssh::create(&params.engine_options(), |_| {});
    let mut session = ssh
        .create_session(params.session_options(), |_| {})
        .expect("session should be created");

    let outcome = AssertUnwindSafe(with_session(
        &mut session,
        timeout,
        async |_session: &mut Session| -> Result<(), Error> { panic!("boom") },
    ))
    .catch_unwind()
    .await;

    assert!(outcome.is_err());
    assert!(!session.is_connected());
}

#[derive(Debug)]
struct AgentChannel;

impl<'s> TypedChannel<'s> for AgentChannel {
    const KIND: ChannelKind = ChannelKind::AgentForwarding;

    fn from_channel(_channel: Channel<'s>) -> Self {
        AgentChannel
    }
}

/// Test: typed retrieval of a kind with no channel type on a live session.
/// Expected: UnsupportedChannelType, session still usable.
#[tokio::test]
async fn unsupported_typed_channel() {
    let params = live_params_or_skip!();
    let timeout = params.resolved_connect_timeout();

    let ssh = Ssh::create(&params.engine_options(), |_| {});
    let mut session = ssh
        .create_session(params.session_options(), |_| {})
        .expect("session should be created");

    let result: Result<(), Error> =
        with_session(&mut session, timeout, async |session: &mut Session| {
            let err = session.create_channel::<AgentChannel>().unwrap_err();
            assert!(matches!(err, Error::UnsupportedChannelType(ref kind) if kind == "agent-forwarding"));
            assert!(session.is_connected());
            Ok(())
        })
        .await;

    result.expect("session scope should succeed");
}

/// Test: strict host key checking against an empty known hosts file.
/// Expected: connection error mentioning the host key.
#[tokio::test]
async fn strict_host_key_rejects_unknown_server() {
    let params = live_params_or_skip!();
    let dir = tempfile::tempdir().unwrap();
    let known_hosts = dir.path().join("known_hosts");
    std::fs::write(&known_hosts, "").unwrap();

    let params = params
        .known_hosts(&known_hosts)
        .property("StrictHostKeyChecking", "yes");

    let err = execute_remote_as_string("echo X", &params)
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Connection { ref reason, .. } if reason.contains("host key")));
    assert!(!err.is_retryable());
}

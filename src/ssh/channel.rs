//! Channel lifecycle over a connected session.
//!
//! A [`Channel`] borrows the [`Session`] it was opened from, so the session
//! outlives it by construction. [`Session::open_channel`] only checks the
//! session and records the type; the engine work happens on connect:
//!
//! | Type | Connect |
//! |------|---------|
//! | `session` | open a session channel |
//! | `shell` | session channel, PTY request, shell request |
//! | `exec` | session channel, exec request |
//! | `x11` | session channel, x11-req |
//! | `auth-agent@openssh.com` | session channel, agent forwarding request |
//! | `sftp` | session channel, `sftp` subsystem request |
//! | `subsystem` | session channel, subsystem request |
//! | `direct-tcpip` | direct-tcpip open to the target |
//! | `forwarded-tcpip` | `tcpip-forward`, then the first forwarded connection |

use std::fmt;
use std::io::{self, Write};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::error::{Error, Result};
use super::output::{ChannelOutput, LineReader, Stream};
use super::scope::{Connectable, scoped, within};
use super::session::Session;

/// Every channel type the engine knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelType {
    Session,
    Shell,
    Exec,
    X11,
    AgentForwarding,
    DirectTcpIp,
    ForwardedTcpIp,
    Sftp,
    Subsystem,
}

impl ChannelType {
    /// Name of the channel type as the engine knows it.
    pub fn engine_name(self) -> &'static str {
        match self {
            ChannelType::Session => "session",
            ChannelType::Shell => "shell",
            ChannelType::Exec => "exec",
            ChannelType::X11 => "x11",
            ChannelType::AgentForwarding => "auth-agent@openssh.com",
            ChannelType::DirectTcpIp => "direct-tcpip",
            ChannelType::ForwardedTcpIp => "forwarded-tcpip",
            ChannelType::Sftp => "sftp",
            ChannelType::Subsystem => "subsystem",
        }
    }
}

impl fmt::Display for ChannelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.engine_name())
    }
}

/// Terminal requested by shell channels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PtyRequest {
    pub term: String,
    pub columns: u32,
    pub rows: u32,
}

impl Default for PtyRequest {
    fn default() -> Self {
        Self {
            term: "xterm".to_string(),
            columns: 80,
            rows: 24,
        }
    }
}

/// X11 forwarding parameters. The cookie defaults to a fresh random value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct X11Request {
    pub single_connection: bool,
    pub auth_protocol: String,
    pub auth_cookie: String,
    pub screen: u32,
}

impl Default for X11Request {
    fn default() -> Self {
        Self {
            single_connection: true,
            auth_protocol: "MIT-MAGIC-COOKIE-1".to_string(),
            auth_cookie: Uuid::new_v4().simple().to_string(),
            screen: 0,
        }
    }
}

/// Per-type settings, consulted on connect.
#[derive(Debug, Default)]
struct Settings {
    command: Option<String>,
    pty: PtyRequest,
    x11: X11Request,
    subsystem: Option<String>,
    target: Option<(String, u32)>,
    bind: Option<(String, u32)>,
}

/// What a connect attempt has opened so far.
#[derive(Default)]
struct Opened {
    stream: Option<Stream>,
    forward: Option<(String, u32)>,
}

impl Opened {
    /// Close the half-open channel and cancel the forward of a failed connect.
    async fn abandon(&mut self, session: &Session, channel_type: ChannelType) {
        if let Some(stream) = self.stream.take()
            && !stream.is_closed()
            && let Err(e) = stream.raw().close().await
        {
            debug!("Failed to close abandoned {} channel: {}", channel_type, e);
        }
        if let Some((address, port)) = self.forward.take()
            && let Err(e) = session.cancel_forward(&address, port).await
        {
            debug!("Failed to cancel abandoned forward {}:{}: {}", address, port, e);
        }
    }
}

pub struct Channel<'s> {
    session: &'s Session,
    channel_type: ChannelType,
    settings: Settings,
    err_sink: Option<Box<dyn Write + Send>>,
    stream: Option<Stream>,
    /// Bind address and bound port of an active remote forward.
    forward: Option<(String, u32)>,
}

impl<'s> Channel<'s> {
    pub(crate) fn new(session: &'s Session, channel_type: ChannelType) -> Self {
        Self {
            session,
            channel_type,
            settings: Settings::default(),
            err_sink: None,
            stream: None,
            forward: None,
        }
    }

    /// The engine channel type opened on connect.
    pub fn channel_type(&self) -> ChannelType {
        self.channel_type
    }

    /// The session this channel is bound to.
    pub fn session(&self) -> &'s Session {
        self.session
    }

    pub fn is_connected(&self) -> bool {
        self.stream.as_ref().is_some_and(|stream| !stream.is_closed())
    }

    /// Command run by an `exec` channel.
    pub fn set_command(&mut self, command: impl Into<String>) {
        self.settings.command = Some(command.into());
    }

    pub fn command(&self) -> Option<&str> {
        self.settings.command.as_deref()
    }

    /// Where the remote stderr goes. Defaults to discarding it.
    pub fn set_err_stream(&mut self, sink: Box<dyn Write + Send>) {
        match &mut self.stream {
            Some(stream) => stream.set_err(sink),
            None => self.err_sink = Some(sink),
        }
    }

    pub fn set_pty(&mut self, pty: PtyRequest) {
        self.settings.pty = pty;
    }

    pub fn set_x11(&mut self, x11: X11Request) {
        self.settings.x11 = x11;
    }

    /// Subsystem requested by a `subsystem` channel.
    pub fn set_subsystem(&mut self, name: impl Into<String>) {
        self.settings.subsystem = Some(name.into());
    }

    /// Destination of a `direct-tcpip` channel.
    pub fn set_target(&mut self, host: impl Into<String>, port: u32) {
        self.settings.target = Some((host.into(), port));
    }

    /// Remote listen address of a `forwarded-tcpip` channel; port 0 lets the
    /// server choose.
    pub fn set_bind(&mut self, address: impl Into<String>, port: u32) {
        self.settings.bind = Some((address.into(), port));
    }

    /// Port the server is listening on for an active remote forward.
    pub fn bound_port(&self) -> Option<u32> {
        self.forward.as_ref().map(|(_, port)| *port)
    }

    /// Exit status reported by the remote command, once seen.
    pub fn exit_status(&self) -> Option<u32> {
        self.stream.as_ref().and_then(Stream::exit_status)
    }

    /// The channel's stdout, or `None` when the channel is not connected.
    pub fn stdout(&mut self) -> Option<ChannelOutput<'_>> {
        self.stream.as_mut().map(ChannelOutput::new)
    }

    /// Buffered line reader over stdout.
    pub fn lines(&mut self) -> Option<LineReader<'_>> {
        self.stdout().map(tokio::io::BufReader::new)
    }

    /// Read until the server closes the channel, forwarding stderr, and
    /// return the exit status. Unread stdout is discarded.
    pub async fn finish(&mut self) -> Result<Option<u32>> {
        let stream = self.stream_mut()?;
        stream.drain().await?;
        Ok(stream.exit_status())
    }

    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let channel_type = self.channel_type;
        self.stream_mut()?
            .raw()
            .data(data)
            .await
            .map_err(|e| Error::channel(channel_type, e))
    }

    /// Half-close: tell the server no more data is coming.
    pub async fn send_eof(&mut self) -> Result<()> {
        let channel_type = self.channel_type;
        self.stream_mut()?
            .raw()
            .eof()
            .await
            .map_err(|e| Error::channel(channel_type, e))
    }

    fn stream_mut(&mut self) -> Result<&mut Stream> {
        let channel_type = self.channel_type;
        self.stream.as_mut().ok_or_else(|| {
            Error::ProtocolState(format!("{} channel is not connected", channel_type))
        })
    }

    /// Open the channel and issue its type's requests within `timeout`.
    ///
    /// On failure or timeout, whatever was opened on the server so far is
    /// closed again before the error is returned.
    pub async fn connect(&mut self, timeout: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        if !self.session.is_connected() {
            return Err(Error::ProtocolState(format!(
                "cannot connect {} channel: session {} is not connected",
                self.channel_type,
                self.session.id()
            )));
        }

        let channel_type = self.channel_type;
        let mut opened = Opened::default();
        let establish = Self::establish(self.session, &self.settings, channel_type, &mut opened);
        let failure = match within(timeout, establish).await {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e),
            Err(_) => Some(Error::channel(
                channel_type,
                format!("timed out after {:?}", timeout),
            )),
        };
        if let Some(e) = failure {
            opened.abandon(self.session, channel_type).await;
            return Err(e);
        }

        let Some(mut stream) = opened.stream.take() else {
            return Err(Error::ProtocolState(format!(
                "{} channel opened without a stream",
                channel_type
            )));
        };
        stream.set_err(
            self.err_sink
                .take()
                .unwrap_or_else(|| Box::new(io::sink())),
        );
        self.stream = Some(stream);
        self.forward = opened.forward.take();
        info!(
            "Opened {} channel on session {}",
            channel_type,
            self.session.id()
        );
        Ok(())
    }

    /// Open on the engine and send the type's requests. Everything opened is
    /// recorded in `opened` as soon as it exists.
    async fn establish(
        session: &Session,
        settings: &Settings,
        channel_type: ChannelType,
        opened: &mut Opened,
    ) -> Result<()> {
        let fail = |e: russh::Error| Error::channel(channel_type, e);

        match channel_type {
            ChannelType::Session => {
                opened.stream = Some(Stream::new(session.open_session_channel().await?));
            }
            ChannelType::Shell => {
                let stream = opened.stream.insert(Stream::new(session.open_session_channel().await?));
                let pty = &settings.pty;
                stream
                    .raw()
                    .request_pty(false, &pty.term, pty.columns, pty.rows, 0, 0, &[])
                    .await
                    .map_err(fail)?;
                stream.raw().request_shell(true).await.map_err(fail)?;
                stream.await_reply(channel_type, "shell request").await?;
            }
            ChannelType::Exec => {
                let command = settings.command.as_deref().ok_or_else(|| {
                    Error::ProtocolState("exec channel has no command".to_string())
                })?;
                let stream = opened.stream.insert(Stream::new(session.open_session_channel().await?));
                debug!("Executing on session {}: {}", session.id(), command);
                stream.raw().exec(true, command).await.map_err(fail)?;
                stream.await_reply(channel_type, "exec request").await?;
            }
            ChannelType::X11 => {
                let x11 = &settings.x11;
                let stream = opened.stream.insert(Stream::new(session.open_session_channel().await?));
                stream
                    .raw()
                    .request_x11(
                        true,
                        x11.single_connection,
                        x11.auth_protocol.as_str(),
                        x11.auth_cookie.as_str(),
                        x11.screen,
                    )
                    .await
                    .map_err(fail)?;
                stream.await_reply(channel_type, "x11 request").await?;
            }
            ChannelType::AgentForwarding => {
                let stream = opened.stream.insert(Stream::new(session.open_session_channel().await?));
                stream.raw().agent_forward(true).await.map_err(fail)?;
                stream.await_reply(channel_type, "agent forwarding request").await?;
            }
            ChannelType::Sftp => {
                let stream = opened.stream.insert(Stream::new(session.open_session_channel().await?));
                stream.raw().request_subsystem(true, "sftp").await.map_err(fail)?;
                stream.await_reply(channel_type, "sftp subsystem").await?;
            }
            ChannelType::Subsystem => {
                let name = settings.subsystem.as_deref().ok_or_else(|| {
                    Error::ProtocolState("subsystem channel has no subsystem name".to_string())
                })?;
                let stream = opened.stream.insert(Stream::new(session.open_session_channel().await?));
                stream.raw().request_subsystem(true, name).await.map_err(fail)?;
                stream
                    .await_reply(channel_type, &format!("subsystem {}", name))
                    .await?;
            }
            ChannelType::DirectTcpIp => {
                let (host, port) = settings.target.as_ref().ok_or_else(|| {
                    Error::ProtocolState("direct-tcpip channel has no target".to_string())
                })?;
                opened.stream = Some(Stream::new(session.open_direct_tcpip(host, *port).await?));
            }
            ChannelType::ForwardedTcpIp => {
                let (address, port) = settings.bind.as_ref().ok_or_else(|| {
                    Error::ProtocolState("forwarded-tcpip channel has no bind address".to_string())
                })?;
                let bound = session.request_forward(address, *port).await?;
                opened.forward = Some((address.clone(), bound));
                info!(
                    "Session {} listening on remote {}:{}",
                    session.id(),
                    address,
                    bound
                );
                let connection = session.next_forwarded(address, bound).await?;
                debug!(
                    "Accepted forwarded connection from {}:{}",
                    connection.originator_address, connection.originator_port
                );
                opened.stream = Some(Stream::new(connection.channel));
            }
        }

        Ok(())
    }

    /// Close the channel and cancel any remote forward. A no-op when not
    /// connected.
    pub async fn disconnect(&mut self) -> Result<()> {
        let channel_type = self.channel_type;
        let mut result = Ok(());

        if let Some(stream) = self.stream.take()
            && !stream.is_closed()
            && let Err(e) = stream.raw().close().await
        {
            result = Err(Error::channel(channel_type, e));
        }

        if let Some((address, port)) = self.forward.take()
            && let Err(e) = self.session.cancel_forward(&address, port).await
        {
            result = result.and(Err(e));
        }

        debug!(
            "Closed {} channel on session {}",
            channel_type,
            self.session.id()
        );
        result
    }
}

impl Drop for Channel<'_> {
    fn drop(&mut self) {
        if self.forward.is_some() {
            warn!(
                "{} channel dropped with an active remote forward on session {}",
                self.channel_type,
                self.session.id()
            );
        }

        let Some(stream) = self.stream.take() else {
            return;
        };
        if stream.is_closed() {
            return;
        }

        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channel = stream.into_raw();
            runtime.spawn(async move {
                if let Err(e) = channel.close().await {
                    debug!("Close of dropped channel failed: {}", e);
                }
            });
        }
    }
}

impl fmt::Debug for Channel<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel")
            .field("type", &self.channel_type)
            .field("session", &self.session.id())
            .field("settings", &self.settings)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connectable for Channel<'_> {
    fn is_connected(&self) -> bool {
        Channel::is_connected(self)
    }

    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        Channel::connect(self, timeout).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        Channel::disconnect(self).await
    }

    fn describe(&self) -> String {
        format!(
            "{} channel on session {}",
            self.channel_type,
            self.session.id()
        )
    }
}

/// Connect `channel` if needed, run `operation`, and always disconnect.
///
/// Works with [`Channel`] and every typed wrapper.
pub async fn with_channel<C, T, E, F>(
    channel: &mut C,
    timeout: Duration,
    operation: F,
) -> std::result::Result<T, E>
where
    C: Connectable + ?Sized,
    E: From<Error>,
    F: AsyncFnOnce(&mut C) -> std::result::Result<T, E>,
{
    scoped(channel, timeout, operation).await
}

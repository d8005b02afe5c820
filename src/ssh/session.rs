//! Session lifecycle: create, connect, use, disconnect.
//!
//! A [`Session`] is one logical connection to `host:port` as `username`. It is
//! created unconnected by [`Ssh::create_session`](super::Ssh::create_session),
//! connected through [`with_session`] (or [`Session::connect`] directly), and
//! disconnected exactly once.
//!
//! # Lifecycle
//!
//! 1. **Create**: properties are merged over `StrictHostKeyChecking=no` and
//!    validated. No network I/O.
//! 2. **Connect**: TCP connect, handshake (host key checked by
//!    [`ClientHandler`]), then the authentication chain in
//!    `PreferredAuthentications` order. The whole step is bounded by the
//!    connect timeout.
//! 3. **Use**: channels borrow the session, so it cannot be dropped or
//!    disconnected while one is alive.
//! 4. **Disconnect**: graceful `SSH_MSG_DISCONNECT`. A session dropped while
//!    still connected is torn down according to its daemon flag.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use russh::client::{self, Msg};
use russh::{Channel as RawChannel, Disconnect};
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::auth::{AuthChain, AuthStrategy};
use super::channel::{Channel, ChannelType};
use super::config::{
    DEFAULT_SSH_PORT, Properties, SessionSettings, merge_properties, require_non_blank,
};
use super::engine::{Identity, Ssh};
use super::error::{Error, Result};
use super::handler::{ClientHandler, ForwardQueue, ForwardedConnection, close_forwarded};
use super::scope::{Connectable, scoped, within};
use super::typed::TypedChannel;

/// Inputs for [`Ssh::create_session`](super::Ssh::create_session).
///
/// Defaults: port 22, empty password, non-daemon, no extra properties.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub host: String,
    pub username: String,
    pub password: String,
    pub port: u16,
    pub daemon: bool,
    pub properties: Properties,
}

impl SessionOptions {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            password: String::new(),
            port: DEFAULT_SSH_PORT,
            daemon: false,
            properties: Properties::new(),
        }
    }

    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = password.into();
        self
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }
}

/// Build the russh client configuration for a session.
///
/// There is no inactivity timeout: a one-shot session lives exactly as long as
/// its scope, and dead peers are detected by keepalives.
pub(crate) fn build_client_config(settings: &SessionSettings) -> Arc<client::Config> {
    let compression = if settings.compression {
        (&[russh::compression::ZLIB, russh::compression::NONE][..]).into()
    } else {
        (&[russh::compression::NONE][..]).into()
    };

    let preferred = russh::Preferred {
        compression,
        ..Default::default()
    };

    Arc::new(client::Config {
        inactivity_timeout: None,
        keepalive_interval: settings.keepalive_interval,
        keepalive_max: settings.keepalive_max,
        preferred,
        ..Default::default()
    })
}

/// The live engine connection of a connected session.
struct Link {
    handle: Mutex<client::Handle<ClientHandler>>,
    forwarded: Mutex<ForwardQueue>,
}

pub struct Session {
    id: Uuid,
    host: String,
    port: u16,
    username: String,
    password: String,
    daemon: bool,
    properties: Properties,
    identities: Vec<Identity>,
    known_hosts: Option<PathBuf>,
    link: Option<Link>,
    connected_at: Option<DateTime<Utc>>,
}

impl Session {
    pub(crate) fn new(ssh: &Ssh, options: &SessionOptions) -> Result<Self> {
        require_non_blank("host", &options.host)?;
        require_non_blank("username", &options.username)?;
        if options.port == 0 {
            return Err(Error::ConfigResolution(
                "port must be between 1 and 65535".into(),
            ));
        }

        let properties = merge_properties(&options.properties);
        SessionSettings::from_properties(&properties)?;

        let session = Self {
            id: Uuid::new_v4(),
            host: options.host.clone(),
            port: options.port,
            username: options.username.clone(),
            password: String::new(),
            daemon: options.daemon,
            properties,
            identities: ssh.identities().to_vec(),
            known_hosts: ssh.known_hosts().map(PathBuf::from),
            link: None,
            connected_at: None,
        }
        .with_password(&options.password);

        debug!(
            "Created session {} for {}@{} ({} identities, known hosts: {:?})",
            session.id,
            session.username,
            session.target(),
            session.identities.len(),
            session.known_hosts
        );
        Ok(session)
    }

    fn with_password(mut self, password: &str) -> Self {
        if !password.trim().is_empty() {
            self.password = password.to_string();
        }
        self
    }

    /// Identifier used in this session's log lines.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Host this session connects to.
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Server port this session connects to.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// `host:port`, as used in error messages.
    pub fn target(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Effective value of a configuration key.
    pub fn config(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &Properties {
        &self.properties
    }

    /// Set one configuration key. A malformed value for a recognized key is
    /// rejected and leaves the configuration unchanged. Takes effect on the
    /// next connect.
    pub fn set_config(&mut self, key: impl Into<String>, value: impl Into<String>) -> Result<()> {
        let mut properties = self.properties.clone();
        properties.insert(key.into(), value.into());
        SessionSettings::from_properties(&properties)?;
        self.properties = properties;
        Ok(())
    }

    /// Replace the password. Takes effect on the next connect; an empty
    /// password disables password authentication.
    pub fn set_password(&mut self, password: impl Into<String>) {
        self.password = password.into();
    }

    pub fn has_password(&self) -> bool {
        !self.password.is_empty()
    }

    /// When set, dropping this session while connected releases the transport
    /// without a disconnect.
    pub fn set_daemon(&mut self, daemon: bool) {
        self.daemon = daemon;
    }

    pub fn is_daemon(&self) -> bool {
        self.daemon
    }

    /// When the current connection was established; `None` while disconnected.
    pub fn connected_at(&self) -> Option<DateTime<Utc>> {
        self.connected_at
    }

    pub fn is_connected(&self) -> bool {
        match &self.link {
            // A locked handle is in use by a channel, so it is alive
            Some(link) => link
                .handle
                .try_lock()
                .map(|handle| !handle.is_closed())
                .unwrap_or(true),
            None => false,
        }
    }

    /// Connect and authenticate within `timeout` (`Duration::ZERO` blocks).
    ///
    /// Does nothing when already connected.
    pub async fn connect(&mut self, timeout: Duration) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        // Drop a link whose transport died on its own
        self.link = None;

        let settings = SessionSettings::from_properties(&self.properties)?;
        let target = self.target();
        info!(
            "Connecting session {} to {}@{} (StrictHostKeyChecking={})",
            self.id, self.username, target, settings.host_key_policy
        );

        let (forwarded_tx, forwarded_rx) = mpsc::unbounded_channel();
        let handle = match within(timeout, self.establish(&settings, forwarded_tx)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(Error::connection(
                    &target,
                    format!("connection timed out after {:?}", timeout),
                ));
            }
        };

        self.link = Some(Link {
            handle: Mutex::new(handle),
            forwarded: Mutex::new(ForwardQueue::new(forwarded_rx)),
        });
        self.connected_at = Some(Utc::now());
        info!("Session {} connected to {}@{}", self.id, self.username, target);
        Ok(())
    }

    async fn establish(
        &self,
        settings: &SessionSettings,
        forwarded: mpsc::UnboundedSender<ForwardedConnection>,
    ) -> Result<client::Handle<ClientHandler>> {
        let target = self.target();
        let handler = ClientHandler::new(
            self.host.clone(),
            self.port,
            settings.host_key_policy,
            self.known_hosts.clone(),
            forwarded,
        );

        let mut handle = client::connect(
            build_client_config(settings),
            (self.host.as_str(), self.port),
            handler,
        )
        .await
        .map_err(|e| match e {
            russh::Error::UnknownKey => Error::connection(
                &target,
                format!(
                    "server host key rejected (StrictHostKeyChecking={})",
                    settings.host_key_policy
                ),
            ),
            other => Error::connection(&target, format!("failed to connect: {}", other)),
        })?;

        let chain = AuthChain::for_session(&settings.auth_order, &self.identities, &self.password);
        debug!("Session {} auth order: {:?}", self.id, chain.names());

        let failure = match chain.authenticate(&mut handle, &self.username).await {
            Ok(true) => return Ok(handle),
            Ok(false) => "no authentication method succeeded".to_string(),
            Err(e) => e,
        };

        if let Err(e) = handle
            .disconnect(Disconnect::ByApplication, "authentication failed", "en")
            .await
        {
            debug!("Failed to close unauthenticated transport: {}", e);
        }
        Err(Error::connection(
            &target,
            format!("authentication failed for {}: {}", self.username, failure),
        ))
    }

    /// Gracefully disconnect. A no-op on an unconnected session.
    pub async fn disconnect(&mut self) -> Result<()> {
        self.connected_at = None;
        let Some(link) = self.link.take() else {
            return Ok(());
        };

        let handle = link.handle.into_inner();
        if handle.is_closed() {
            debug!("Session {} transport already closed", self.id);
            return Ok(());
        }

        handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await
            .map_err(|e| Error::connection(self.target(), format!("disconnect failed: {}", e)))?;
        info!("Session {} disconnected from {}", self.id, self.target());
        Ok(())
    }

    /// Open an unconnected channel of `channel_type` bound to this session.
    pub fn open_channel(&self, channel_type: ChannelType) -> Result<Channel<'_>> {
        if !self.is_connected() {
            return Err(Error::ProtocolState(format!(
                "cannot open {} channel: session {} is not connected",
                channel_type, self.id
            )));
        }
        Ok(Channel::new(self, channel_type))
    }

    /// Open a typed channel. Kinds without a channel type fail before the
    /// connection state is looked at.
    pub fn create_channel<'s, C: TypedChannel<'s>>(&'s self) -> Result<C> {
        let channel_type = C::KIND.channel_type()?;
        let channel = self.open_channel(channel_type)?;
        Ok(C::from_channel(channel))
    }

    fn link(&self) -> Result<&Link> {
        self.link.as_ref().ok_or_else(|| {
            Error::ProtocolState(format!("session {} is not connected", self.id))
        })
    }

    pub(crate) async fn open_session_channel(&self) -> Result<RawChannel<Msg>> {
        let link = self.link()?;
        let handle = link.handle.lock().await;
        handle
            .channel_open_session()
            .await
            .map_err(|e| Error::channel(ChannelType::Session, e))
    }

    pub(crate) async fn open_direct_tcpip(&self, host: &str, port: u32) -> Result<RawChannel<Msg>> {
        let link = self.link()?;
        let handle = link.handle.lock().await;
        handle
            .channel_open_direct_tcpip(host, port, "127.0.0.1", 0)
            .await
            .map_err(|e| Error::channel(ChannelType::DirectTcpIp, e))
    }

    /// Ask the server to listen on `address:port`; returns the bound port.
    pub(crate) async fn request_forward(&self, address: &str, port: u32) -> Result<u32> {
        let link = self.link()?;
        let bound = {
            let mut handle = link.handle.lock().await;
            let bound = handle
                .tcpip_forward(address, port)
                .await
                .map_err(|e| Error::channel(ChannelType::ForwardedTcpIp, e))?;
            if port == 0 { bound } else { port }
        };
        link.forwarded.lock().await.register(address, bound);
        Ok(bound)
    }

    /// Cancel a remote forward and close the connections still queued for it.
    pub(crate) async fn cancel_forward(&self, address: &str, port: u32) -> Result<()> {
        let link = self.link()?;
        let stale = link.forwarded.lock().await.unregister(address, port);
        if !stale.is_empty() {
            debug!(
                "Closing {} unclaimed connections for {}:{} on session {}",
                stale.len(),
                address,
                port,
                self.id
            );
        }
        for connection in stale {
            close_forwarded(connection).await;
        }

        let handle = link.handle.lock().await;
        handle
            .cancel_tcpip_forward(address, port)
            .await
            .map_err(|e| Error::channel(ChannelType::ForwardedTcpIp, e))
    }

    /// Wait for the next connection the server forwards from `address:port`.
    pub(crate) async fn next_forwarded(&self, address: &str, port: u32) -> Result<ForwardedConnection> {
        let link = self.link()?;
        let mut forwarded = link.forwarded.lock().await;
        forwarded.next_for(address, port).await.ok_or_else(|| {
            Error::channel(
                ChannelType::ForwardedTcpIp,
                "session closed before a connection was forwarded",
            )
        })
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(link) = self.link.take() else {
            return;
        };

        if self.daemon {
            debug!("Releasing daemon session {} without disconnect", self.id);
            return;
        }

        let handle = link.handle.into_inner();
        if handle.is_closed() {
            return;
        }

        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let id = self.id;
                warn!("Session {} dropped while connected, disconnecting", id);
                runtime.spawn(async move {
                    if let Err(e) = handle
                        .disconnect(Disconnect::ByApplication, "", "en")
                        .await
                    {
                        debug!("Disconnect of dropped session {} failed: {}", id, e);
                    }
                });
            }
            Err(_) => warn!(
                "Session {} dropped outside a runtime, closing without disconnect",
                self.id
            ),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("target", &self.target())
            .field("username", &self.username)
            .field("daemon", &self.daemon)
            .field("properties", &self.properties)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connectable for Session {
    fn is_connected(&self) -> bool {
        Session::is_connected(self)
    }

    async fn connect(&mut self, timeout: Duration) -> Result<()> {
        Session::connect(self, timeout).await
    }

    async fn disconnect(&mut self) -> Result<()> {
        Session::disconnect(self).await
    }

    fn describe(&self) -> String {
        format!("session {} ({}@{})", self.id, self.username, self.target())
    }
}

/// Connect `session` if needed, run `operation`, and always disconnect.
///
/// See [`scoped`] for the exit-path guarantees.
pub async fn with_session<T, E, F>(
    session: &mut Session,
    timeout: Duration,
    operation: F,
) -> std::result::Result<T, E>
where
    E: From<Error>,
    F: AsyncFnOnce(&mut Session) -> std::result::Result<T, E>,
{
    scoped(session, timeout, operation).await
}

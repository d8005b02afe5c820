//! russh client handler: host key verification and forwarded connections.
//!
//! The handler applies the session's `StrictHostKeyChecking` policy against
//! the engine's known hosts file:
//!
//! | Policy | Trusted | Unknown | Changed | No known hosts |
//! |--------|---------|---------|---------|----------------|
//! | `no` | accept | accept | accept (warn) | accept |
//! | `accept-new` | accept | accept + learn | reject | accept |
//! | `yes` / `ask` | accept | reject | reject | reject |
//!
//! Connections the server opens back to us after a `tcpip-forward` request
//! are handed to the session over an unbounded channel and sorted by
//! [`ForwardQueue`]: each one goes to the channel bound to its listen address.

use std::path::PathBuf;

use russh::keys::PublicKey;
use russh::keys::known_hosts::{check_known_hosts_path, learn_known_hosts_path};
use russh::{Channel, client};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::config::HostKeyPolicy;

/// Where the server's key stands relative to known hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KnownHostStatus {
    Trusted,
    Unknown,
    Changed,
    NoTrustStore,
}

/// Whether `policy` lets a key with `status` through.
pub(crate) fn accepts(policy: HostKeyPolicy, status: KnownHostStatus) -> bool {
    match (policy, status) {
        (HostKeyPolicy::No, _) => true,
        (HostKeyPolicy::AcceptNew, KnownHostStatus::Changed) => false,
        (HostKeyPolicy::AcceptNew, _) => true,
        (HostKeyPolicy::Yes | HostKeyPolicy::Ask, KnownHostStatus::Trusted) => true,
        (HostKeyPolicy::Yes | HostKeyPolicy::Ask, _) => false,
    }
}

/// A connection the server forwarded to us over a remote port forward.
pub struct ForwardedConnection {
    pub channel: Channel<client::Msg>,
    pub connected_address: String,
    pub connected_port: u32,
    pub originator_address: String,
    pub originator_port: u32,
}

pub(crate) struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    known_hosts: Option<PathBuf>,
    forwarded: mpsc::UnboundedSender<ForwardedConnection>,
}

impl ClientHandler {
    pub fn new(
        host: String,
        port: u16,
        policy: HostKeyPolicy,
        known_hosts: Option<PathBuf>,
        forwarded: mpsc::UnboundedSender<ForwardedConnection>,
    ) -> Self {
        Self {
            host,
            port,
            policy,
            known_hosts,
            forwarded,
        }
    }

    fn status_of(&self, key: &PublicKey) -> KnownHostStatus {
        let Some(path) = &self.known_hosts else {
            return KnownHostStatus::NoTrustStore;
        };

        match check_known_hosts_path(&self.host, self.port, key, path) {
            Ok(true) => KnownHostStatus::Trusted,
            Ok(false) => KnownHostStatus::Unknown,
            Err(russh::keys::Error::KeyChanged { line }) => {
                warn!(
                    "Host key for {}:{} does not match {:?} line {}",
                    self.host, self.port, path, line
                );
                KnownHostStatus::Changed
            }
            Err(e) => {
                warn!("Failed to read known hosts {:?}: {}", path, e);
                KnownHostStatus::Unknown
            }
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let status = self.status_of(server_public_key);
        let accepted = accepts(self.policy, status);
        debug!(
            "Host key for {}:{} is {:?}, StrictHostKeyChecking={}, accepted={}",
            self.host, self.port, status, self.policy, accepted
        );

        if accepted
            && self.policy == HostKeyPolicy::AcceptNew
            && status == KnownHostStatus::Unknown
            && let Some(path) = &self.known_hosts
            && let Err(e) = learn_known_hosts_path(&self.host, self.port, server_public_key, path)
        {
            warn!("Failed to record host key in {:?}: {}", path, e);
        }

        Ok(accepted)
    }

    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Forwarded connection to {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );
        let connection = ForwardedConnection {
            channel,
            connected_address: connected_address.to_string(),
            connected_port,
            originator_address: originator_address.to_string(),
            originator_port,
        };
        if self.forwarded.send(connection).is_err() {
            debug!("Session no longer accepts forwarded connections, dropping");
        }
        Ok(())
    }
}

/// Where an incoming forwarded connection goes while a channel waits on
/// its own bind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Route {
    /// It was forwarded from the bind being waited on.
    Take,
    /// It belongs to another active forward on the same session.
    Hold,
    /// Its forward was cancelled or never requested.
    Close,
}

pub(crate) fn route(active: &[(String, u32)], wanted: (&str, u32), got: (&str, u32)) -> Route {
    if got == wanted {
        Route::Take
    } else if active.iter().any(|(address, port)| (address.as_str(), *port) == got) {
        Route::Hold
    } else {
        Route::Close
    }
}

/// Per-session queue of forwarded connections, keyed by listen address.
pub(crate) struct ForwardQueue {
    incoming: mpsc::UnboundedReceiver<ForwardedConnection>,
    active: Vec<(String, u32)>,
    held: Vec<ForwardedConnection>,
}

impl ForwardQueue {
    pub fn new(incoming: mpsc::UnboundedReceiver<ForwardedConnection>) -> Self {
        Self {
            incoming,
            active: Vec::new(),
            held: Vec::new(),
        }
    }

    /// Start accepting connections forwarded from `address:port`.
    pub fn register(&mut self, address: &str, port: u32) {
        self.active.push((address.to_string(), port));
    }

    /// Stop accepting connections for `address:port`. Returns the ones
    /// already queued for it; the caller closes them.
    pub fn unregister(&mut self, address: &str, port: u32) -> Vec<ForwardedConnection> {
        self.active
            .retain(|(a, p)| (a.as_str(), *p) != (address, port));
        while let Ok(connection) = self.incoming.try_recv() {
            self.held.push(connection);
        }

        let active = &self.active;
        let (keep, stale): (Vec<_>, Vec<_>) = self.held.drain(..).partition(|c| {
            active
                .iter()
                .any(|(a, p)| (a.as_str(), *p) == (c.connected_address.as_str(), c.connected_port))
        });
        self.held = keep;
        stale
    }

    /// Wait for the next connection forwarded from `address:port`.
    ///
    /// Connections for other active forwards are kept for their channels;
    /// connections for forwards nobody holds any more are closed. `None`
    /// means the session is gone.
    pub async fn next_for(&mut self, address: &str, port: u32) -> Option<ForwardedConnection> {
        let wanted = (address, port);
        if let Some(index) = self
            .held
            .iter()
            .position(|c| (c.connected_address.as_str(), c.connected_port) == wanted)
        {
            return Some(self.held.remove(index));
        }

        loop {
            let connection = self.incoming.recv().await?;
            let got = (connection.connected_address.as_str(), connection.connected_port);
            match route(&self.active, wanted, got) {
                Route::Take => return Some(connection),
                Route::Hold => self.held.push(connection),
                Route::Close => {
                    debug!(
                        "Closing forwarded connection for inactive {}:{}",
                        connection.connected_address, connection.connected_port
                    );
                    close_forwarded(connection).await;
                }
            }
        }
    }
}

pub(crate) async fn close_forwarded(connection: ForwardedConnection) {
    if let Err(e) = connection.channel.close().await {
        debug!("Failed to close forwarded connection: {}", e);
    }
}

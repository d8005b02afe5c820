//! Typed channels.
//!
//! [`Session::create_channel`](super::Session::create_channel) picks the
//! channel type from the requested wrapper's [`ChannelKind`]. Only kinds with
//! a wrapper map to a channel type; the rest fail with
//! [`Error::UnsupportedChannelType`].

use std::fmt;
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use async_trait::async_trait;

use super::channel::{Channel, ChannelType, PtyRequest};
use super::error::{Error, Result};
use super::scope::Connectable;

/// Concrete channel kinds a caller can ask for by type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
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

impl ChannelKind {
    pub fn channel_type(self) -> Result<ChannelType> {
        match self {
            ChannelKind::Shell => Ok(ChannelType::Shell),
            ChannelKind::Exec => Ok(ChannelType::Exec),
            ChannelKind::DirectTcpIp => Ok(ChannelType::DirectTcpIp),
            ChannelKind::ForwardedTcpIp => Ok(ChannelType::ForwardedTcpIp),
            ChannelKind::Sftp => Ok(ChannelType::Sftp),
            other => Err(Error::UnsupportedChannelType(other.to_string())),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelKind::Session => "session",
            ChannelKind::Shell => "shell",
            ChannelKind::Exec => "exec",
            ChannelKind::X11 => "x11",
            ChannelKind::AgentForwarding => "agent-forwarding",
            ChannelKind::DirectTcpIp => "direct-tcpip",
            ChannelKind::ForwardedTcpIp => "forwarded-tcpip",
            ChannelKind::Sftp => "sftp",
            ChannelKind::Subsystem => "subsystem",
        };
        f.write_str(name)
    }
}

/// A channel wrapper that can be created by type.
pub trait TypedChannel<'s>: Sized {
    const KIND: ChannelKind;

    fn from_channel(channel: Channel<'s>) -> Self;
}

macro_rules! typed_channel {
    ($(#[$meta:meta])* $name:ident, $kind:expr) => {
        $(#[$meta])*
        #[derive(Debug)]
        pub struct $name<'s>(Channel<'s>);

        impl<'s> TypedChannel<'s> for $name<'s> {
            const KIND: ChannelKind = $kind;

            fn from_channel(channel: Channel<'s>) -> Self {
                Self(channel)
            }
        }

        impl<'s> $name<'s> {
            pub fn into_inner(self) -> Channel<'s> {
                self.0
            }
        }

        impl<'s> Deref for $name<'s> {
            type Target = Channel<'s>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        impl DerefMut for $name<'_> {
            fn deref_mut(&mut self) -> &mut Self::Target {
                &mut self.0
            }
        }

        #[async_trait]
        impl Connectable for $name<'_> {
            fn is_connected(&self) -> bool {
                self.0.is_connected()
            }

            async fn connect(&mut self, timeout: Duration) -> Result<()> {
                self.0.connect(timeout).await
            }

            async fn disconnect(&mut self) -> Result<()> {
                self.0.disconnect().await
            }

            fn describe(&self) -> String {
                Connectable::describe(&self.0)
            }
        }
    };
}

typed_channel!(
    /// Runs one command; stdout is read through [`Channel::stdout`].
    ExecChannel,
    ChannelKind::Exec
);

typed_channel!(
    /// Interactive shell on a pseudo-terminal.
    ShellChannel,
    ChannelKind::Shell
);

typed_channel!(
    /// The `sftp` subsystem. The channel carries raw SFTP packets.
    SftpChannel,
    ChannelKind::Sftp
);

typed_channel!(
    /// Local-to-remote TCP tunnel.
    DirectTcpIpChannel,
    ChannelKind::DirectTcpIp
);

typed_channel!(
    /// First connection accepted on a remote listen port.
    ForwardedTcpIpChannel,
    ChannelKind::ForwardedTcpIp
);

impl ExecChannel<'_> {
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.set_command(command);
        self
    }

    pub fn with_err_stream(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.set_err_stream(sink);
        self
    }
}

impl ShellChannel<'_> {
    pub fn with_pty(mut self, term: impl Into<String>, columns: u32, rows: u32) -> Self {
        self.set_pty(PtyRequest {
            term: term.into(),
            columns,
            rows,
        });
        self
    }
}

impl DirectTcpIpChannel<'_> {
    pub fn with_target(mut self, host: impl Into<String>, port: u32) -> Self {
        self.set_target(host, port);
        self
    }
}

impl ForwardedTcpIpChannel<'_> {
    pub fn with_bind(mut self, address: impl Into<String>, port: u32) -> Self {
        self.set_bind(address, port);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod kind_mapping {
        use super::*;

        #[test]
        fn test_supported_kinds() {
            assert_eq!(ChannelKind::Shell.channel_type().unwrap(), ChannelType::Shell);
            assert_eq!(ChannelKind::Exec.channel_type().unwrap(), ChannelType::Exec);
            assert_eq!(
                ChannelKind::DirectTcpIp.channel_type().unwrap(),
                ChannelType::DirectTcpIp
            );
            assert_eq!(
                ChannelKind::ForwardedTcpIp.channel_type().unwrap(),
                ChannelType::ForwardedTcpIp
            );
            assert_eq!(ChannelKind::Sftp.channel_type().unwrap(), ChannelType::Sftp);
        }

        #[test]
        fn test_unsupported_kinds_name_themselves() {
            for (kind, name) in [
                (ChannelKind::Session, "session"),
                (ChannelKind::X11, "x11"),
                (ChannelKind::AgentForwarding, "agent-forwarding"),
                (ChannelKind::Subsystem, "subsystem"),
            ] {
                let err = kind.channel_type().unwrap_err();
                assert!(
                    matches!(err, Error::UnsupportedChannelType(ref n) if n == name),
                    "{:?}",
                    err
                );
            }
        }

        #[test]
        fn test_wrapper_kinds() {
            assert_eq!(ExecChannel::KIND, ChannelKind::Exec);
            assert_eq!(ShellChannel::KIND, ChannelKind::Shell);
            assert_eq!(SftpChannel::KIND, ChannelKind::Sftp);
            assert_eq!(
                DirectTcpIpChannel::KIND,
                ChannelKind::DirectTcpIp
            );
            assert_eq!(
                ForwardedTcpIpChannel::KIND,
                ChannelKind::ForwardedTcpIp
            );
        }
    }
}

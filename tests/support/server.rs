//! In-process SSH server for hermetic integration tests.
//!
//! Accepts [`PASSWORD`] for any user and answers exec requests from a fixed
//! script:
//!
//! | Command | Reply |
//! |---------|-------|
//! | `refuse` | channel failure |
//! | `sleep ...` | success, then nothing until the client closes |
//! | `echo out; echo err >&2; exit 3` | `out` on stdout, `err` on stderr, status 3 |
//! | `echo TEXT` | `TEXT` and a newline, status 0 |
//! | `printf 'FMT'` | `FMT` with `\n` expanded, status 0 |
//! | anything else | `command not found` on stderr, status 127 |
//!
//! Remote forwards are accepted for any port. For ports configured with
//! [`TestServer::with_forwards`], the server then opens that many forwarded
//! connections back, each sending its listen port as one line.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use russh::keys::PrivateKey;
use russh::keys::ssh_key::private::Ed25519Keypair;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, ChannelId, CryptoVec};
use ssh_scope::ConnectionParams;
use tokio::net::TcpListener;

pub const PASSWORD: &str = "hunter2";

/// Counters shared by every connection to one server.
#[derive(Debug, Default)]
pub struct Stats {
    pub channels_opened: AtomicUsize,
    pub channels_closed: AtomicUsize,
    pub forwards_cancelled: AtomicUsize,
}

pub struct TestServer {
    pub port: u16,
    pub stats: Arc<Stats>,
}

impl TestServer {
    pub async fn start() -> Self {
        Self::with_forwards(&[]).await
    }

    /// Start a server that opens `count` forwarded connections back whenever
    /// a forward is requested on `port`, for each `(port, count)`.
    pub async fn with_forwards(forwards: &[(u32, usize)]) -> Self {
        super::init_tracing();

        let mut config = server::Config {
            auth_rejection_time: Duration::from_millis(10),
            auth_rejection_time_initial: Some(Duration::ZERO),
            inactivity_timeout: None,
            ..Default::default()
        };
        config.keys.push(host_key());
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let stats = Arc::new(Stats::default());
        let handler = ScriptedHandler {
            stats: stats.clone(),
            forwards: Arc::new(forwards.iter().copied().collect()),
        };

        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let config = config.clone();
                let handler = handler.clone();
                tokio::spawn(async move {
                    if let Ok(running) = server::run_stream(config, socket, handler).await {
                        let _ = running.await;
                    }
                });
            }
        });

        Self { port, stats }
    }

    /// Parameters that log in to this server with the password, and no key.
    pub fn params(&self) -> ConnectionParams {
        ConnectionParams::new("127.0.0.1", "tester")
            .port(self.port)
            .password(PASSWORD)
            .private_key("/nonexistent/id_ed25519")
            .known_hosts("/nonexistent/known_hosts")
            .connect_timeout(Duration::from_secs(5))
    }

    /// A known hosts line trusting this server's host key.
    pub fn known_hosts_line(&self) -> String {
        let key = host_key().public_key().to_openssh().unwrap();
        format!("[127.0.0.1]:{} {}\n", self.port, key)
    }

    pub fn closed(&self) -> usize {
        self.stats.channels_closed.load(Ordering::SeqCst)
    }

    /// Wait up to two seconds for at least `count` channel closes.
    pub async fn wait_for_closes(&self, count: usize) -> usize {
        for _ in 0..200 {
            if self.closed() >= count {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        self.closed()
    }
}

fn host_key() -> PrivateKey {
    PrivateKey::from(Ed25519Keypair::from_seed(&[42u8; 32]))
}

enum Reply {
    Refuse,
    Hang,
    Output {
        stdout: String,
        stderr: String,
        status: u32,
    },
}

impl Reply {
    fn output(stdout: impl Into<String>, stderr: impl Into<String>, status: u32) -> Self {
        Reply::Output {
            stdout: stdout.into(),
            stderr: stderr.into(),
            status,
        }
    }
}

fn script(command: &str) -> Reply {
    match command {
        "refuse" => Reply::Refuse,
        "echo out; echo err >&2; exit 3" => Reply::output("out\n", "err\n", 3),
        c if c.starts_with("sleep ") => Reply::Hang,
        c if c.starts_with("echo ") => Reply::output(format!("{}\n", &c[5..]), "", 0),
        c if c.len() > 9 && c.starts_with("printf '") && c.ends_with('\'') => {
            Reply::output(c[8..c.len() - 1].replace("\\n", "\n"), "", 0)
        }
        other => Reply::output("", format!("{}: command not found\n", other), 127),
    }
}

#[derive(Clone)]
struct ScriptedHandler {
    stats: Arc<Stats>,
    forwards: Arc<HashMap<u32, usize>>,
}

impl server::Handler for ScriptedHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, _user: &str, password: &str) -> Result<Auth, Self::Error> {
        Ok(if password == PASSWORD {
            Auth::Accept
        } else {
            Auth::reject()
        })
    }

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        _public_key: &russh::keys::PublicKey,
    ) -> Result<Auth, Self::Error> {
        Ok(Auth::reject())
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.stats.channels_opened.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }

    async fn channel_close(
        &mut self,
        _channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.stats.channels_closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let command = String::from_utf8_lossy(data).into_owned();
        match script(&command) {
            Reply::Refuse => session.channel_failure(channel)?,
            Reply::Hang => session.channel_success(channel)?,
            Reply::Output {
                stdout,
                stderr,
                status,
            } => {
                session.channel_success(channel)?;
                if !stdout.is_empty() {
                    session.data(channel, CryptoVec::from_slice(stdout.as_bytes()))?;
                }
                if !stderr.is_empty() {
                    session.extended_data(channel, 1, CryptoVec::from_slice(stderr.as_bytes()))?;
                }
                session.exit_status_request(channel, status)?;
                session.eof(channel)?;
                session.close(channel)?;
            }
        }
        Ok(())
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if *port == 0 {
            *port = 40000;
        }
        let count = self.forwards.get(port).copied().unwrap_or(0);
        let handle = session.handle();
        let address = address.to_string();
        let port = *port;

        tokio::spawn(async move {
            for i in 0..count {
                let originator_port = 50000 + i as u32;
                let Ok(channel) = handle
                    .channel_open_forwarded_tcpip(address.clone(), port, "10.0.0.9", originator_port)
                    .await
                else {
                    break;
                };
                let line = format!("{}\n", port);
                let _ = channel.data(line.as_bytes()).await;
                let _ = channel.eof().await;
            }
        });
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        _address: &str,
        _port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        self.stats.forwards_cancelled.fetch_add(1, Ordering::SeqCst);
        Ok(true)
    }
}

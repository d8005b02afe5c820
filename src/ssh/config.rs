//! Credential and configuration resolution.
//!
//! Values are resolved with a three-tier priority system:
//!
//! 1. **Parameter** - Explicitly provided override (highest priority)
//! 2. **Environment Variable** - Value from environment variable
//! 3. **Default** - Built-in default value (lowest priority)
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |----------|---------|-------------|
//! | `SSH_CONNECT_TIMEOUT` | 0 | Connect timeout in seconds, 0 blocks |
//! | `SSH_PRIVATE_KEY` | `~/.ssh/id_rsa` | Private key location |
//! | `SSH_KNOWN_HOSTS` | `~/.ssh/known_hosts` | Known hosts location |
//!
//! # Session Properties
//!
//! Every session carries a string map of properties. [`merge_properties`]
//! always seeds it with `StrictHostKeyChecking=no`; caller keys win. The keys
//! below are interpreted, anything else is carried through untouched.
//!
//! | Key | Values | Default |
//! |-----|--------|---------|
//! | `StrictHostKeyChecking` | `yes`, `no`, `ask`, `accept-new` | `no` |
//! | `PreferredAuthentications` | `publickey`, `password` (comma separated) | `publickey,password` |
//! | `ServerAliveInterval` | seconds, 0 disables | 30 |
//! | `ServerAliveCountMax` | count | 3 |
//! | `Compression` | `yes`, `no` | `no` |

use std::collections::BTreeMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::engine::EngineOptions;
use super::error::{Error, Result};
use super::session::SessionOptions;

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default connect timeout in seconds (0 blocks until the engine gives up)
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 0;

pub const STRICT_HOST_KEY_CHECKING: &str = "StrictHostKeyChecking";
pub const PREFERRED_AUTHENTICATIONS: &str = "PreferredAuthentications";
pub const SERVER_ALIVE_INTERVAL: &str = "ServerAliveInterval";
pub const SERVER_ALIVE_COUNT_MAX: &str = "ServerAliveCountMax";
pub const COMPRESSION: &str = "Compression";

pub(crate) const DEFAULT_KEEPALIVE_INTERVAL_SECS: u64 = 30;
pub(crate) const DEFAULT_KEEPALIVE_MAX: usize = 3;

/// Environment variable name for the connect timeout
pub(crate) const CONNECT_TIMEOUT_ENV_VAR: &str = "SSH_CONNECT_TIMEOUT";

/// Environment variable name for the private key location
pub(crate) const PRIVATE_KEY_ENV_VAR: &str = "SSH_PRIVATE_KEY";

/// Environment variable name for the known hosts location
pub(crate) const KNOWN_HOSTS_ENV_VAR: &str = "SSH_KNOWN_HOSTS";

/// Session configuration map. Ordered so logs and comparisons are stable.
pub type Properties = BTreeMap<String, String>;

/// The current user's home directory, from `HOME` or `USERPROFILE`.
pub fn home_dir() -> Option<PathBuf> {
    env::var_os("HOME")
        .or_else(|| env::var_os("USERPROFILE"))
        .filter(|home| !home.is_empty())
        .map(PathBuf::from)
}

/// `<home>/.ssh/id_rsa`, if a home directory is known.
pub fn default_key_location() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".ssh").join("id_rsa"))
}

/// `<home>/.ssh/known_hosts`, if a home directory is known.
pub fn default_known_hosts_location() -> Option<PathBuf> {
    home_dir().map(|home| home.join(".ssh").join("known_hosts"))
}

/// Resolve the connect timeout with priority: parameter -> env var -> default
pub fn resolve_connect_timeout(timeout_param: Option<Duration>) -> Duration {
    if let Some(timeout) = timeout_param {
        return timeout;
    }

    if let Ok(env_timeout) = env::var(CONNECT_TIMEOUT_ENV_VAR)
        && let Ok(secs) = env_timeout.parse::<u64>()
    {
        return Duration::from_secs(secs);
    }

    Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS)
}

/// Resolve the private key path with priority: parameter -> env var -> default
pub fn resolve_private_key(key_param: Option<&Path>) -> Option<PathBuf> {
    resolve_path(key_param, PRIVATE_KEY_ENV_VAR, default_key_location)
}

/// Resolve the known hosts path with priority: parameter -> env var -> default
pub fn resolve_known_hosts(known_hosts_param: Option<&Path>) -> Option<PathBuf> {
    resolve_path(
        known_hosts_param,
        KNOWN_HOSTS_ENV_VAR,
        default_known_hosts_location,
    )
}

fn resolve_path(
    param: Option<&Path>,
    env_var: &str,
    default: fn() -> Option<PathBuf>,
) -> Option<PathBuf> {
    if let Some(path) = param {
        return Some(path.to_path_buf());
    }

    if let Some(env_path) = env::var_os(env_var)
        && !env_path.is_empty()
    {
        return Some(PathBuf::from(env_path));
    }

    default()
}

/// Overlay caller properties on top of `StrictHostKeyChecking=no`.
pub fn merge_properties(overrides: &Properties) -> Properties {
    let mut merged = Properties::new();
    merged.insert(STRICT_HOST_KEY_CHECKING.to_string(), "no".to_string());
    merged.extend(
        overrides
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    merged
}

/// Fail with a message naming `field` when `value` is blank.
pub(crate) fn require_non_blank(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::ConfigResolution(format!("{} must not be blank", field)));
    }
    Ok(())
}

pub(crate) fn validate_path(field: &str, path: &Path) -> Result<()> {
    let raw = path.as_os_str().to_string_lossy();
    if raw.is_empty() {
        return Err(Error::ConfigResolution(format!("{} must not be empty", field)));
    }
    if raw.contains('\0') {
        return Err(Error::ConfigResolution(format!(
            "{} contains a NUL byte: {:?}",
            field, path
        )));
    }
    Ok(())
}

/// How the server's host key is checked against known hosts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostKeyPolicy {
    /// Accept any key.
    No,
    /// Accept only keys present in known hosts.
    Yes,
    /// Like `Yes`; there is no one to ask.
    Ask,
    /// Accept and remember unknown keys, reject changed ones.
    AcceptNew,
}

impl FromStr for HostKeyPolicy {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "no" | "off" => Ok(HostKeyPolicy::No),
            "yes" => Ok(HostKeyPolicy::Yes),
            "ask" => Ok(HostKeyPolicy::Ask),
            "accept-new" => Ok(HostKeyPolicy::AcceptNew),
            other => Err(Error::ConfigResolution(format!(
                "{}: unknown value '{}'",
                STRICT_HOST_KEY_CHECKING, other
            ))),
        }
    }
}

impl fmt::Display for HostKeyPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostKeyPolicy::No => write!(f, "no"),
            HostKeyPolicy::Yes => write!(f, "yes"),
            HostKeyPolicy::Ask => write!(f, "ask"),
            HostKeyPolicy::AcceptNew => write!(f, "accept-new"),
        }
    }
}

/// Authentication methods that `PreferredAuthentications` can order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMethod {
    PublicKey,
    Password,
}

/// Interpreted view of a session's [`Properties`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SessionSettings {
    pub host_key_policy: HostKeyPolicy,
    pub auth_order: Vec<AuthMethod>,
    pub keepalive_interval: Option<Duration>,
    pub keepalive_max: usize,
    pub compression: bool,
}

impl SessionSettings {
    pub fn from_properties(properties: &Properties) -> Result<Self> {
        let host_key_policy = match properties.get(STRICT_HOST_KEY_CHECKING) {
            Some(value) => value.parse()?,
            None => HostKeyPolicy::No,
        };

        let auth_order = match properties.get(PREFERRED_AUTHENTICATIONS) {
            Some(value) => parse_auth_order(value)?,
            None => vec![AuthMethod::PublicKey, AuthMethod::Password],
        };

        let keepalive_secs = parse_number::<u64>(properties, SERVER_ALIVE_INTERVAL)?
            .unwrap_or(DEFAULT_KEEPALIVE_INTERVAL_SECS);
        let keepalive_interval = (keepalive_secs > 0).then(|| Duration::from_secs(keepalive_secs));

        let keepalive_max =
            parse_number::<usize>(properties, SERVER_ALIVE_COUNT_MAX)?.unwrap_or(DEFAULT_KEEPALIVE_MAX);

        let compression = match properties.get(COMPRESSION) {
            Some(value) => parse_yes_no(COMPRESSION, value)?,
            None => false,
        };

        Ok(Self {
            host_key_policy,
            auth_order,
            keepalive_interval,
            keepalive_max,
            compression,
        })
    }
}

fn parse_auth_order(value: &str) -> Result<Vec<AuthMethod>> {
    let mut order = Vec::new();
    for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
        let method = match name {
            "publickey" => AuthMethod::PublicKey,
            "password" => AuthMethod::Password,
            // Methods the engine wrapper does not drive are skipped, as OpenSSH does
            // for methods the server never offers.
            "keyboard-interactive" | "gssapi-with-mic" | "hostbased" => continue,
            other => {
                return Err(Error::ConfigResolution(format!(
                    "{}: unknown method '{}'",
                    PREFERRED_AUTHENTICATIONS, other
                )));
            }
        };
        if !order.contains(&method) {
            order.push(method);
        }
    }

    if order.is_empty() {
        return Err(Error::ConfigResolution(format!(
            "{} names no usable method",
            PREFERRED_AUTHENTICATIONS
        )));
    }
    Ok(order)
}

fn parse_number<T: FromStr>(properties: &Properties, key: &str) -> Result<Option<T>> {
    properties
        .get(key)
        .map(|value| {
            value.trim().parse::<T>().map_err(|_| {
                Error::ConfigResolution(format!("{}: '{}' is not a valid number", key, value))
            })
        })
        .transpose()
}

fn parse_yes_no(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Ok(true),
        "no" | "false" | "0" => Ok(false),
        other => Err(Error::ConfigResolution(format!(
            "{}: expected yes or no, got '{}'",
            key, other
        ))),
    }
}

/// Everything needed to run a command on a remote host.
///
/// Only `host` and `username` are required. Unset paths fall back to the
/// environment and then to `~/.ssh`; see the module docs.
///
/// ```ignore
/// let params = ConnectionParams::new("10.0.0.5", "deploy")
///     .password("secret")
///     .port(2222)
///     .property("StrictHostKeyChecking", "yes");
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionParams {
    pub host: String,
    pub username: String,
    pub password: Option<String>,
    pub private_key: Option<PathBuf>,
    pub passphrase: Option<String>,
    pub known_hosts: Option<PathBuf>,
    pub port: Option<u16>,
    pub connect_timeout: Option<Duration>,
    pub daemon: bool,
    pub properties: Properties,
}

impl ConnectionParams {
    /// Create parameters for `username` on `host`, with every optional field unset.
    ///
    /// # Arguments
    ///
    /// * `host` - Hostname or IP address of the server
    /// * `username` - Login user on the server
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    /// Password for password authentication. A blank password is not offered.
    pub fn password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Private key file to authenticate with. A missing file is skipped.
    pub fn private_key(mut self, path: impl Into<PathBuf>) -> Self {
        self.private_key = Some(path.into());
        self
    }

    /// Passphrase for an encrypted private key.
    pub fn passphrase(mut self, passphrase: impl Into<String>) -> Self {
        self.passphrase = Some(passphrase.into());
        self
    }

    /// Known hosts file consulted by `StrictHostKeyChecking`.
    pub fn known_hosts(mut self, path: impl Into<PathBuf>) -> Self {
        self.known_hosts = Some(path.into());
        self
    }

    /// Server port. Defaults to 22.
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    /// Bound on connecting each session and channel. `Duration::ZERO` waits forever.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = Some(timeout);
        self
    }

    /// Let a dropped, still connected session release its transport without
    /// a disconnect.
    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = daemon;
        self
    }

    /// Override one session configuration key, such as `StrictHostKeyChecking`.
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Check required fields and override syntax before anything touches the network.
    pub fn validate(&self) -> Result<()> {
        require_non_blank("host", &self.host)?;
        require_non_blank("username", &self.username)?;
        if self.port == Some(0) {
            return Err(Error::ConfigResolution("port must be between 1 and 65535".into()));
        }
        if let Some(path) = &self.private_key {
            validate_path("private_key", path)?;
        }
        if let Some(path) = &self.known_hosts {
            validate_path("known_hosts", path)?;
        }
        SessionSettings::from_properties(&merge_properties(&self.properties))?;
        Ok(())
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            private_key: resolve_private_key(self.private_key.as_deref()),
            passphrase: self.passphrase.clone().unwrap_or_default(),
            known_hosts: resolve_known_hosts(self.known_hosts.as_deref()),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            host: self.host.clone(),
            username: self.username.clone(),
            password: self.password.clone().unwrap_or_default(),
            port: self.port.unwrap_or(DEFAULT_SSH_PORT),
            daemon: self.daemon,
            properties: self.properties.clone(),
        }
    }

    pub fn resolved_connect_timeout(&self) -> Duration {
        resolve_connect_timeout(self.connect_timeout)
    }
}

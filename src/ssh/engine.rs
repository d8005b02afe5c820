//! SSH engine handle: identities, known hosts, and the session factory.
//!
//! Building an [`Ssh`] is purely local. Key files and the known hosts file are
//! only referenced here; key material is parsed when a session authenticates
//! and known hosts are consulted during the handshake. A missing key or known
//! hosts file is not an error, it just means password-only auth or unverified
//! hosts.

use std::fmt;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::config::{default_key_location, default_known_hosts_location};
use super::error::Result;
use super::session::{Session, SessionOptions};

/// A private key registered with the engine.
#[derive(Clone, PartialEq, Eq)]
pub struct Identity {
    key_path: PathBuf,
    passphrase: Option<String>,
}

impl Identity {
    pub fn new(key_path: impl Into<PathBuf>, passphrase: Option<String>) -> Self {
        Self {
            key_path: key_path.into(),
            passphrase: passphrase.filter(|p| !p.trim().is_empty()),
        }
    }

    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    pub fn passphrase(&self) -> Option<&str> {
        self.passphrase.as_deref()
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("key_path", &self.key_path)
            .field("passphrase", &self.passphrase.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Inputs for [`Ssh::create`].
///
/// `Default` points at `~/.ssh/id_rsa` and `~/.ssh/known_hosts` with an empty
/// passphrase.
#[derive(Clone)]
pub struct EngineOptions {
    pub private_key: Option<PathBuf>,
    pub passphrase: String,
    pub known_hosts: Option<PathBuf>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            private_key: default_key_location(),
            passphrase: String::new(),
            known_hosts: default_known_hosts_location(),
        }
    }
}

impl fmt::Debug for EngineOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineOptions")
            .field("private_key", &self.private_key)
            .field("known_hosts", &self.known_hosts)
            .finish_non_exhaustive()
    }
}

/// Engine handle shared by every session it creates.
#[derive(Debug, Clone, Default)]
pub struct Ssh {
    identities: Vec<Identity>,
    known_hosts: Option<PathBuf>,
}

impl Ssh {
    /// An engine with no identities and no trust store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the key and known hosts from `options` when they exist on disk,
    /// then hand the engine to `customize`.
    pub fn create(options: &EngineOptions, customize: impl FnOnce(&mut Ssh)) -> Self {
        let mut ssh = Ssh::new();

        match &options.private_key {
            Some(key_path) if key_path.exists() => {
                debug!("Registering identity {:?}", key_path);
                ssh.add_identity(key_path, Some(options.passphrase.clone()));
            }
            Some(key_path) => debug!("No private key at {:?}, skipping identity", key_path),
            None => debug!("No private key location, skipping identity"),
        }

        match &options.known_hosts {
            Some(path) if path.exists() => {
                debug!("Using known hosts from {:?}", path);
                ssh.set_known_hosts(path);
            }
            Some(path) => debug!("No known hosts at {:?}, host keys are unverified", path),
            None => debug!("No known hosts location, host keys are unverified"),
        }

        customize(&mut ssh);
        ssh
    }

    /// Register a key file. A blank passphrase is treated as none.
    pub fn add_identity(&mut self, key_path: impl Into<PathBuf>, passphrase: Option<String>) {
        self.identities.push(Identity::new(key_path, passphrase));
    }

    pub fn set_known_hosts(&mut self, path: impl Into<PathBuf>) {
        self.known_hosts = Some(path.into());
    }

    pub fn identities(&self) -> &[Identity] {
        &self.identities
    }

    pub fn known_hosts(&self) -> Option<&Path> {
        self.known_hosts.as_deref()
    }

    /// Create an unconnected session for `options.username@options.host:options.port`.
    ///
    /// Properties are merged over `StrictHostKeyChecking=no` and validated
    /// here, so a malformed value fails before any network I/O. The password is
    /// only set when it is non-blank.
    pub fn create_session(
        &self,
        options: SessionOptions,
        customize: impl FnOnce(&mut Session),
    ) -> Result<Session> {
        let mut session = Session::new(self, &options)?;
        customize(&mut session);
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn options_in(dir: &Path, passphrase: &str) -> EngineOptions {
        EngineOptions {
            private_key: Some(dir.join("id_rsa")),
            passphrase: passphrase.to_string(),
            known_hosts: Some(dir.join("known_hosts")),
        }
    }

    mod create {
        use super::*;

        #[test]
        fn test_missing_files_are_skipped() {
            let dir = tempfile::tempdir().unwrap();
            let ssh = Ssh::create(&options_in(dir.path(), ""), |_| {});

            assert!(ssh.identities().is_empty());
            assert!(ssh.known_hosts().is_none());
        }

        #[test]
        fn test_existing_files_are_registered() {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("id_rsa"), "key").unwrap();
            fs::write(dir.path().join("known_hosts"), "").unwrap();

            let ssh = Ssh::create(&options_in(dir.path(), "secret"), |_| {});

            assert_eq!(ssh.identities().len(), 1);
            assert_eq!(ssh.identities()[0].key_path(), dir.path().join("id_rsa"));
            assert_eq!(ssh.identities()[0].passphrase(), Some("secret"));
            assert_eq!(ssh.known_hosts(), Some(dir.path().join("known_hosts").as_path()));
        }

        #[test]
        fn test_blank_passphrase_is_not_attached() {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("id_rsa"), "key").unwrap();

            let ssh = Ssh::create(&options_in(dir.path(), "   "), |_| {});

            assert_eq!(ssh.identities().len(), 1);
            assert_eq!(ssh.identities()[0].passphrase(), None);
        }

        #[test]
        fn test_no_locations_at_all() {
            let options = EngineOptions {
                private_key: None,
                passphrase: String::new(),
                known_hosts: None,
            };
            let ssh = Ssh::create(&options, |_| {});
            assert!(ssh.identities().is_empty());
            assert!(ssh.known_hosts().is_none());
        }

        #[test]
        fn test_customize_runs_last() {
            let dir = tempfile::tempdir().unwrap();
            fs::write(dir.path().join("id_rsa"), "key").unwrap();

            let ssh = Ssh::create(&options_in(dir.path(), ""), |ssh| {
                assert_eq!(ssh.identities().len(), 1);
                ssh.add_identity("/keys/extra", None);
                ssh.set_known_hosts("/keys/known_hosts");
            });

            assert_eq!(ssh.identities().len(), 2);
            assert_eq!(ssh.known_hosts(), Some(Path::new("/keys/known_hosts")));
        }
    }

    mod identity {
        use super::*;

        #[test]
        fn test_debug_redacts_passphrase() {
            let identity = Identity::new("/keys/id_rsa", Some("hunter2".into()));
            let rendered = format!("{:?}", identity);
            assert!(!rendered.contains("hunter2"));
            assert!(rendered.contains("<redacted>"));
        }
    }
}

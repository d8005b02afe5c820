//! Ordered authentication chain.

use async_trait::async_trait;
use russh::client;
use tracing::debug;

use crate::ssh::config::AuthMethod;
use crate::ssh::engine::Identity;
use crate::ssh::handler::ClientHandler;

use super::traits::AuthStrategy;
use super::{AgentAuth, KeyAuth, PasswordAuth};

/// Tries strategies in the order they were added; the first accepted one wins.
///
/// ```ignore
/// let chain = AuthChain::new()
///     .with_key(Identity::new("/keys/id_ed25519", None))
///     .with_password("secret");
///
/// chain.authenticate(&mut handle, "deploy").await?;
/// ```
pub struct AuthChain {
    strategies: Vec<Box<dyn AuthStrategy>>,
}

impl AuthChain {
    pub fn new() -> Self {
        Self {
            strategies: Vec::new(),
        }
    }

    /// Build the chain for a session.
    ///
    /// `publickey` adds one strategy per identity, `password` adds the password
    /// when it is non-blank. With nothing to offer, the SSH agent is used.
    pub fn for_session(order: &[AuthMethod], identities: &[Identity], password: &str) -> Self {
        let mut chain = AuthChain::new();

        for method in order {
            match method {
                AuthMethod::PublicKey => {
                    for identity in identities {
                        chain = chain.with_key(identity.clone());
                    }
                }
                AuthMethod::Password if !password.trim().is_empty() => {
                    chain = chain.with_password(password);
                }
                AuthMethod::Password => {}
            }
        }

        if chain.is_empty() {
            chain = chain.with_agent();
        }

        chain
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.strategies.push(Box::new(PasswordAuth::new(password)));
        self
    }

    pub fn with_key(mut self, identity: Identity) -> Self {
        self.strategies.push(Box::new(KeyAuth::new(identity)));
        self
    }

    pub fn with_agent(mut self) -> Self {
        self.strategies.push(Box::new(AgentAuth::new()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.strategies.is_empty()
    }

    /// Strategy names in the order they will be tried.
    pub fn names(&self) -> Vec<&'static str> {
        self.strategies.iter().map(|s| s.name()).collect()
    }
}

impl Default for AuthChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuthStrategy for AuthChain {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        if self.strategies.is_empty() {
            return Err("no authentication methods to try".to_string());
        }

        let mut failures = Vec::new();
        for strategy in &self.strategies {
            let name = strategy.name();
            debug!("Offering {} for {}", name, username);
            match strategy.authenticate(handle, username).await {
                Ok(true) => {
                    debug!("Server accepted {} for {}", name, username);
                    return Ok(true);
                }
                Ok(false) => failures.push(format!("{}: rejected", name)),
                Err(e) => failures.push(format!("{}: {}", name, e)),
            }
        }

        debug!("All methods failed for {}: {:?}", username, failures);
        Err(failures.join("; "))
    }

    fn name(&self) -> &'static str {
        "chain"
    }
}

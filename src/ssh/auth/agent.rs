//! SSH agent authentication.

use async_trait::async_trait;
use russh::client;
use russh::keys::agent::client::AgentClient;
use tracing::{debug, info};

use crate::ssh::handler::ClientHandler;

use super::traits::AuthStrategy;

/// Tries every identity offered by the agent at `SSH_AUTH_SOCK`.
#[derive(Default)]
pub struct AgentAuth;

impl AgentAuth {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl AuthStrategy for AgentAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let mut agent = AgentClient::connect_env()
            .await
            .map_err(|e| format!("no SSH agent reachable via SSH_AUTH_SOCK: {}", e))?;
        let offered = agent
            .request_identities()
            .await
            .map_err(|e| format!("SSH agent refused to list identities: {}", e))?;
        debug!("SSH agent offers {} identities for {}", offered.len(), username);

        // Only consulted for RSA identities; same answer for every key
        let rsa_hash = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();

        for key in offered {
            let comment = key.comment().to_string();
            match handle
                .authenticate_publickey_with(username, key, rsa_hash, &mut agent)
                .await
            {
                Ok(outcome) if outcome.success() => {
                    info!("Authenticated {} with agent identity {:?}", username, comment);
                    return Ok(true);
                }
                Ok(_) => debug!("Agent identity {:?} rejected", comment),
                Err(e) => debug!("Agent identity {:?} failed: {}", comment, e),
            }
        }

        Ok(false)
    }

    fn name(&self) -> &'static str {
        "agent"
    }
}

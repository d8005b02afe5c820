//! Private key file authentication.

use std::sync::Arc;

use async_trait::async_trait;
use russh::{client, keys};
use tracing::debug;

use crate::ssh::engine::Identity;
use crate::ssh::handler::ClientHandler;

use super::traits::AuthStrategy;

/// Authenticates with one registered identity.
///
/// The key file is read and decrypted here, at authentication time, so an
/// engine can reference keys that are never used.
pub struct KeyAuth {
    identity: Identity,
}

impl KeyAuth {
    pub fn new(identity: Identity) -> Self {
        Self { identity }
    }
}

#[async_trait]
impl AuthStrategy for KeyAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        let key_path = self.identity.key_path();
        let key_pair = keys::load_secret_key(key_path, self.identity.passphrase())
            .map_err(|e| format!("Failed to load private key from {:?}: {}", key_path, e))?;

        // RSA keys need the strongest hash the server supports
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        debug!("Using RSA hash algorithm for {:?}: {:?}", key_path, hash_alg);

        let key_with_hash = keys::PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);

        let result = handle
            .authenticate_publickey(username, key_with_hash)
            .await
            .map_err(|e| format!("Key authentication failed: {}", e))?;

        Ok(result.success())
    }

    fn name(&self) -> &'static str {
        "publickey"
    }
}

//! Authentication strategy trait.

use async_trait::async_trait;
use russh::client;

use crate::ssh::handler::ClientHandler;

/// One way of proving identity to the server.
///
/// Strategies are tried by [`AuthChain`](super::AuthChain) in order until one
/// is accepted.
#[async_trait]
pub trait AuthStrategy: Send + Sync {
    /// Attempt to authenticate `username` over `handle`.
    ///
    /// # Returns
    ///
    /// * `Ok(true)` - Authentication succeeded
    /// * `Ok(false)` - The server rejected the credentials
    /// * `Err(message)` - The attempt could not be made (unreadable key, no agent, transport error)
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, String>;

    /// Short name used in log lines.
    fn name(&self) -> &'static str;
}

//! Password authentication.

use async_trait::async_trait;
use russh::client;

use crate::ssh::handler::ClientHandler;

use super::traits::AuthStrategy;

pub struct PasswordAuth {
    password: String,
}

impl PasswordAuth {
    pub fn new(password: impl Into<String>) -> Self {
        Self {
            password: password.into(),
        }
    }
}

#[async_trait]
impl AuthStrategy for PasswordAuth {
    async fn authenticate(
        &self,
        handle: &mut client::Handle<ClientHandler>,
        username: &str,
    ) -> Result<bool, String> {
        handle
            .authenticate_password(username, self.password.as_str())
            .await
            .map(|outcome| outcome.success())
            .map_err(|e| format!("password exchange with server failed: {}", e))
    }

    fn name(&self) -> &'static str {
        "password"
    }
}

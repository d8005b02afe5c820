//! Authentication strategies for session connect.
//!
//! - [`KeyAuth`]: one registered identity (key file + optional passphrase)
//! - [`PasswordAuth`]: the session password
//! - [`AgentAuth`]: identities held by the running SSH agent
//!
//! [`AuthChain::for_session`] orders them by `PreferredAuthentications`.

mod agent;
mod chain;
mod key;
mod password;
mod traits;

pub use agent::AgentAuth;
pub use chain::AuthChain;
pub use key::KeyAuth;
pub use password::PasswordAuth;
pub use traits::AuthStrategy;

//! Shared helpers for integration tests.
//!
//! Live-server tests read their target from the environment (or a `.env`
//! file) and skip when `SSH_TEST_HOST` is unset:
//!
//! | Variable | Default |
//! |----------|---------|
//! | `SSH_TEST_HOST` | (required) |
//! | `SSH_TEST_PORT` | 22 |
//! | `SSH_TEST_USER` | `root` |
//! | `SSH_TEST_PASSWORD` | none |
//! | `SSH_TEST_KEY` | none |

use std::env;
use std::sync::Once;
use std::time::Duration;

use ssh_scope::ConnectionParams;

static TRACING_INIT: Once = Once::new();

/// Initialize tracing for tests. Safe to call multiple times.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        use tracing_subscriber::EnvFilter;
        let filter = EnvFilter::from_default_env()
            .add_directive("ssh_scope=debug".parse().unwrap())
            .add_directive("russh=info".parse().unwrap());
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init()
            .ok();
    });
}

/// Connection parameters for the live test server, if one is configured.
#[allow(dead_code)]
pub fn live_params() -> Option<ConnectionParams> {
    init_tracing();
    dotenv::dotenv().ok();

    let host = env::var("SSH_TEST_HOST").ok().filter(|h| !h.trim().is_empty())?;
    let user = env::var("SSH_TEST_USER").unwrap_or_else(|_| "root".to_string());

    let mut params =
        ConnectionParams::new(host, user).connect_timeout(Duration::from_secs(15));
    if let Some(port) = env::var("SSH_TEST_PORT").ok().and_then(|p| p.parse().ok()) {
        params = params.port(port);
    }
    if let Ok(password) = env::var("SSH_TEST_PASSWORD") {
        params = params.password(password);
    }
    if let Ok(key) = env::var("SSH_TEST_KEY") {
        params = params.private_key(key);
    }
    Some(params)
}

/// A local port with nothing listening on it.
#[allow(dead_code)]
pub fn closed_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// Unwrap [`live_params`] or return early from the test.
#[allow(unused_macros)]
macro_rules! live_params_or_skip {
    () => {
        match support::live_params() {
            Some(params) => params,
            None => {
                eprintln!("SSH_TEST_HOST not set, skipping live test");
                return;
            }
        }
    };
}

pub mod server;

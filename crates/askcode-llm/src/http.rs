//! Shared HTTP client construction for consistent timeout and TLS configuration.

use std::time::Duration;

/// Create a shared HTTP client with standard askcode configuration.
///
/// Config: 30s connect timeout, caller-supplied request timeout, rustls TLS,
/// `askcode/{version}` user-agent, redirect limit 10.
pub(crate) fn client_with_timeout(timeout: Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .timeout(timeout)
        .user_agent(concat!("askcode/", env!("CARGO_PKG_VERSION")))
        .redirect(reqwest::redirect::Policy::limited(10))
        .build()
        .unwrap_or_else(|e| {
            tracing::warn!("falling back to default HTTP client: {e}");
            reqwest::Client::new()
        })
}

pub(crate) fn default_client() -> reqwest::Client {
    client_with_timeout(Duration::from_secs(60))
}

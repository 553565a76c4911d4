//! Checks whether the network is up before trying fallback hosts.

use std::future::Future;

use tracing::debug;

/// Answers whether the internet is reachable.
///
/// Consulted after a recoverable failure: if the network itself is down
/// there is no point cycling through fallback hosts.
pub trait ConnectivityProbe: Send + Sync + 'static {
    /// Returns `true` if the network is reachable.
    fn check(&self) -> impl Future<Output = bool> + Send;
}

/// Fetches a URL over HTTP and expects a body containing `yes`.
#[derive(Debug, Clone)]
pub struct HttpConnectivityProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpConnectivityProbe {
    /// Creates a probe for `url`.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

impl ConnectivityProbe for HttpConnectivityProbe {
    async fn check(&self) -> bool {
        let response = match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => response,
            Ok(response) => {
                debug!(status = %response.status(), "connectivity check failed");
                return false;
            }
            Err(e) => {
                debug!(error = %e, "connectivity check failed");
                return false;
            }
        };
        match response.text().await {
            Ok(body) => body.contains("yes"),
            Err(e) => {
                debug!(error = %e, "connectivity check body unreadable");
                false
            }
        }
    }
}

/// A probe with a fixed answer.
#[derive(Debug, Clone, Copy)]
pub struct StaticConnectivity(pub bool);

impl ConnectivityProbe for StaticConnectivity {
    async fn check(&self) -> bool {
        self.0
    }
}

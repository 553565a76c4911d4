//! `RealtimeClient` builder and client handle.
//!
//! This is the entry point for applications. It ties the layers together:
//! transport → protocol → encoding → connection.

use std::future::Future;
use std::time::Duration;

use tidewire_connection::{
    AuthOptions, ClientOptions, ConnectionManager, ConnectionState, ConnectionStateChange,
    ConnectivityProbe, HttpConnectivityProbe,
};
use tidewire_protocol::{ErrorInfo, Format};
use tidewire_transport::{Transport, WebSocketTransport};
use tokio::sync::broadcast;

use crate::channel::Channel;
use crate::TidewireError;

/// Builder for configuring and starting a realtime client.
///
/// # Example
///
/// ```rust,ignore
/// use tidewire::prelude::*;
///
/// let client = RealtimeClient::builder()
///     .key("app.key:secret")
///     .client_id("alice")
///     .build()?;
/// client.channel("chat").publish("greeting", "hello").await?;
/// ```
#[derive(Debug, Clone, Default)]
pub struct RealtimeClientBuilder {
    options: ClientOptions,
}

impl RealtimeClientBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces every option at once.
    pub fn options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// Authenticates with an API key.
    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.options.auth.key = Some(key.into());
        self
    }

    /// Authenticates with an access token.
    pub fn token(mut self, token: impl Into<String>) -> Self {
        self.options.auth.token = Some(token.into());
        self
    }

    /// Renews tokens with `callback`.
    pub fn token_callback<F, Fut>(mut self, callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ErrorInfo>> + Send + 'static,
    {
        self.options.auth.token_callback = AuthOptions::with_token_callback(callback).token_callback;
        self
    }

    /// Sets the client id the connection publishes as.
    pub fn client_id(mut self, client_id: impl Into<String>) -> Self {
        self.options.client_id = Some(client_id.into());
        self
    }

    /// Sets the wire framing.
    pub fn format(mut self, format: Format) -> Self {
        self.options.format = format;
        self
    }

    /// Whether the server echoes this client's own messages.
    pub fn echo_messages(mut self, echo: bool) -> Self {
        self.options.echo_messages = echo;
        self
    }

    /// Whether publishes made while not connected are queued.
    pub fn queue_messages(mut self, queue: bool) -> Self {
        self.options.queue_messages = queue;
        self
    }

    /// Connects to a custom host.
    pub fn host(mut self, host: impl Into<String>) -> Self {
        self.options.host = Some(host.into());
        self
    }

    /// Connects on a custom port.
    pub fn port(mut self, port: u16) -> Self {
        self.options.port = Some(port);
        self
    }

    /// Use `wss://` (default) or plain `ws://`.
    pub fn tls(mut self, tls: bool) -> Self {
        self.options.tls = tls;
        self
    }

    /// Connects to a named environment.
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.options.environment = Some(environment.into());
        self
    }

    /// Sets the fallback hosts explicitly.
    pub fn fallback_hosts(mut self, hosts: Vec<String>) -> Self {
        self.options.fallback_hosts = Some(hosts);
        self
    }

    /// Base delay before retrying a lost connection.
    pub fn disconnected_retry_timeout(mut self, timeout: Duration) -> Self {
        self.options.disconnected_retry_timeout = timeout;
        self
    }

    /// Delay between retries once the connection is suspended.
    pub fn suspended_retry_timeout(mut self, timeout: Duration) -> Self {
        self.options.suspended_retry_timeout = timeout;
        self
    }

    /// Timeout for every network request.
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.options.realtime_request_timeout = timeout;
        self
    }

    /// How long to wait for the server to confirm a close.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.options.close_timeout = timeout;
        self
    }

    /// Recovers a previous connection, given as `"<key>:<serial>"`.
    pub fn recover(mut self, recover: impl Into<String>) -> Self {
        self.options.recover = Some(recover.into());
        self
    }

    /// URL fetched to check whether the network is up.
    pub fn connectivity_check_url(mut self, url: impl Into<String>) -> Self {
        self.options.connectivity_check_url = url.into();
        self
    }

    /// Whether to connect as soon as the client is built (default `true`).
    pub fn auto_connect(mut self, auto_connect: bool) -> Self {
        self.options.auto_connect = auto_connect;
        self
    }

    /// The options built so far.
    pub fn client_options(&self) -> &ClientOptions {
        &self.options
    }

    /// Builds the client over WebSocket.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn build(self) -> Result<RealtimeClient, TidewireError> {
        let probe = HttpConnectivityProbe::new(self.options.connectivity_check_url.clone());
        self.build_with(WebSocketTransport::new(), probe)
    }

    /// Builds the client over a custom transport and connectivity probe.
    pub fn build_with<T, P>(self, transport: T, probe: P) -> Result<RealtimeClient, TidewireError>
    where
        T: Transport,
        P: ConnectivityProbe,
    {
        let request_timeout = self.options.realtime_request_timeout.max(ClientOptions::MIN_TIMEOUT);
        let connection = ConnectionManager::with_probe(transport, probe, self.options)?;
        tracing::debug!("realtime client built");
        Ok(RealtimeClient {
            connection,
            request_timeout,
        })
    }
}

/// A realtime client.
///
/// Cheap to clone; all clones share one connection, which closes when the
/// last clone (and every [`Channel`] taken from it) is dropped.
#[derive(Debug, Clone)]
pub struct RealtimeClient {
    connection: ConnectionManager,
    request_timeout: Duration,
}

impl RealtimeClient {
    /// Creates a new builder.
    pub fn builder() -> RealtimeClientBuilder {
        RealtimeClientBuilder::new()
    }

    /// The underlying connection.
    pub fn connection(&self) -> &ConnectionManager {
        &self.connection
    }

    /// A handle to the channel called `name`.
    pub fn channel(&self, name: impl Into<String>) -> Channel {
        Channel::new(name.into(), self.connection.clone(), self.request_timeout)
    }

    /// The connection state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Subscribes to connection state changes.
    pub fn on_state_change(&self) -> broadcast::Receiver<ConnectionStateChange> {
        self.connection.on_state_change()
    }

    /// Starts connecting.
    pub async fn connect(&self) -> Result<(), TidewireError> {
        Ok(self.connection.connect().await?)
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), TidewireError> {
        Ok(self.connection.close().await?)
    }

    /// Measures a heartbeat round trip.
    pub async fn ping(&self) -> Result<Duration, TidewireError> {
        Ok(self.connection.ping().await?)
    }
}

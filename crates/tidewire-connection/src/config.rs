//! Client options.

use std::time::Duration;

use tidewire_protocol::Format;
use tracing::warn;

use crate::auth::AuthOptions;

/// Production realtime host.
pub const DEFAULT_HOST: &str = "realtime.tidewire.io";

/// Fallback hosts used with [`DEFAULT_HOST`].
pub const DEFAULT_FALLBACK_HOSTS: [&str; 5] = [
    "a.fallback.tidewire.io",
    "b.fallback.tidewire.io",
    "c.fallback.tidewire.io",
    "d.fallback.tidewire.io",
    "e.fallback.tidewire.io",
];

/// Endpoint answering `yes` when the internet is reachable.
pub const DEFAULT_CONNECTIVITY_CHECK_URL: &str = "https://internet-up.tidewire.io/is-the-internet-up.txt";

/// Maximum message size assumed until the server advertises one.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 65_536;

/// Options for a realtime connection.
///
/// `Default` connects to the production host over TLS with JSON framing and
/// no credentials; set [`auth`](Self::auth) before connecting.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Credentials.
    pub auth: AuthOptions,
    /// Identity the connection publishes as.
    pub client_id: Option<String>,
    /// Wire framing.
    pub format: Format,
    /// Whether the server echoes this connection's own messages back.
    pub echo_messages: bool,
    /// Whether messages published before the connection is up are queued.
    pub queue_messages: bool,
    /// Custom realtime host. Disables the default fallback hosts.
    pub host: Option<String>,
    /// Custom port. Disables the default fallback hosts.
    pub port: Option<u16>,
    /// Use `wss://`.
    pub tls: bool,
    /// Named environment, prefixed to the default host. Disables the default
    /// fallback hosts.
    pub environment: Option<String>,
    /// Explicit fallback hosts, used even with a custom host.
    pub fallback_hosts: Option<Vec<String>>,
    /// Base delay before retrying from `Disconnected`.
    pub disconnected_retry_timeout: Duration,
    /// Delay before retrying from `Suspended`.
    pub suspended_retry_timeout: Duration,
    /// Timeout for every network request (connect, token, probe, ping).
    pub realtime_request_timeout: Duration,
    /// How long the server keeps connection state, until it says otherwise.
    pub connection_state_ttl: Duration,
    /// How long to wait for the server to confirm a close.
    pub close_timeout: Duration,
    /// `"<connectionKey>:<connectionSerial>"` of a previous connection to
    /// recover on the first connect.
    pub recover: Option<String>,
    /// URL the connectivity probe fetches.
    pub connectivity_check_url: String,
    /// Connect as soon as the manager is created.
    pub auto_connect: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            auth: AuthOptions::default(),
            client_id: None,
            format: Format::Json,
            echo_messages: true,
            queue_messages: true,
            host: None,
            port: None,
            tls: true,
            environment: None,
            fallback_hosts: None,
            disconnected_retry_timeout: Duration::from_secs(15),
            suspended_retry_timeout: Duration::from_secs(30),
            realtime_request_timeout: Duration::from_secs(10),
            connection_state_ttl: Duration::from_secs(120),
            close_timeout: Duration::from_secs(10),
            recover: None,
            connectivity_check_url: DEFAULT_CONNECTIVITY_CHECK_URL.to_string(),
            auto_connect: true,
        }
    }
}

impl ClientOptions {
    /// Shortest accepted timeout.
    pub const MIN_TIMEOUT: Duration = Duration::from_millis(100);

    /// Options authenticating with an API key.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            auth: AuthOptions::with_key(key),
            ..Default::default()
        }
    }

    /// Clamps out-of-range values, logging each adjustment.
    pub fn validated(mut self) -> Self {
        for (name, value) in [
            ("disconnected_retry_timeout", &mut self.disconnected_retry_timeout),
            ("suspended_retry_timeout", &mut self.suspended_retry_timeout),
            ("realtime_request_timeout", &mut self.realtime_request_timeout),
            ("close_timeout", &mut self.close_timeout),
        ] {
            if *value < Self::MIN_TIMEOUT {
                warn!(option = name, value = ?value, min = ?Self::MIN_TIMEOUT, "timeout too short, clamping");
                *value = Self::MIN_TIMEOUT;
            }
        }
        if self.client_id.as_deref() == Some("*") {
            warn!("wildcard client_id is not allowed on a connection, ignoring");
            self.client_id = None;
        }
        self
    }

    /// The host the first attempt of every run goes to.
    pub fn primary_host(&self) -> String {
        match (&self.host, &self.environment) {
            (Some(host), _) => host.clone(),
            (None, Some(env)) if env != "production" => format!("{env}-{DEFAULT_HOST}"),
            _ => DEFAULT_HOST.to_string(),
        }
    }

    /// The fallback hosts for this configuration.
    ///
    /// Explicit `fallback_hosts` always win. Otherwise only the default
    /// production host has fallbacks.
    pub fn resolved_fallback_hosts(&self) -> Vec<String> {
        if let Some(hosts) = &self.fallback_hosts {
            return hosts.clone();
        }
        let custom = self.host.is_some()
            || self.port.is_some()
            || self.environment.as_deref().is_some_and(|env| env != "production");
        if custom {
            Vec::new()
        } else {
            DEFAULT_FALLBACK_HOSTS.iter().map(|h| h.to_string()).collect()
        }
    }

    /// The port connections use.
    pub fn resolved_port(&self) -> u16 {
        self.port.unwrap_or(if self.tls { 443 } else { 80 })
    }

    /// Splits [`recover`](Self::recover) into key and serial.
    pub fn recover_point(&self) -> Option<(String, i64)> {
        let recover = self.recover.as_deref()?;
        let (key, serial) = recover.rsplit_once(':')?;
        if key.is_empty() {
            return None;
        }
        let serial = serial.parse().ok()?;
        Some((key.to_string(), serial))
    }
}

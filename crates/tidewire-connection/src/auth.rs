//! Credentials and the token renewal hook.
//!
//! Obtaining tokens is the application's business. The connection only needs
//! a way to ask for a fresh one when the server reports that the current
//! token expired or was rejected.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tidewire_protocol::ErrorInfo;

/// Future returned by a [`TokenCallback`].
pub type TokenFuture = Pin<Box<dyn Future<Output = Result<String, ErrorInfo>> + Send>>;

/// Produces a fresh access token.
pub type TokenCallback = Arc<dyn Fn() -> TokenFuture + Send + Sync>;

/// How the client authenticates.
#[derive(Clone, Default)]
pub struct AuthOptions {
    /// API key, sent as the `key` query parameter.
    pub key: Option<String>,
    /// Access token, sent as the `accessToken` query parameter.
    pub token: Option<String>,
    /// Called to renew `token`.
    pub token_callback: Option<TokenCallback>,
}

impl AuthOptions {
    /// Authenticates with an API key.
    pub fn with_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            ..Default::default()
        }
    }

    /// Authenticates with a fixed token that cannot be renewed.
    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            token: Some(token.into()),
            ..Default::default()
        }
    }

    /// Authenticates with tokens from `callback`, which is also used for
    /// the first token.
    pub fn with_token_callback<F, Fut>(callback: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, ErrorInfo>> + Send + 'static,
    {
        Self {
            token_callback: Some(Arc::new(move || -> TokenFuture { Box::pin(callback()) })),
            ..Default::default()
        }
    }

    /// Whether the token can be renewed.
    pub fn can_renew(&self) -> bool {
        self.token_callback.is_some()
    }

    /// Whether any credential is configured.
    pub fn is_configured(&self) -> bool {
        self.key.is_some() || self.token.is_some() || self.token_callback.is_some()
    }
}

impl fmt::Debug for AuthOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthOptions")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("token", &self.token.as_ref().map(|_| "<redacted>"))
            .field("token_callback", &self.token_callback.is_some())
            .finish()
    }
}

/// The credential a connection attempt presents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Credential {
    Key(String),
    Token(String),
}

impl Credential {
    /// Picks the credential to connect with. A renewed token wins over
    /// anything configured up front.
    pub(crate) fn select(auth: &AuthOptions, renewed: Option<&str>) -> Option<Self> {
        if let Some(token) = renewed {
            return Some(Self::Token(token.to_owned()));
        }
        if let Some(token) = &auth.token {
            return Some(Self::Token(token.clone()));
        }
        auth.key.clone().map(Self::Key)
    }
}

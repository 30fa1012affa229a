//! Source of access tokens for authenticated calls.

use crate::{error::Error, token::Token};
use async_trait::async_trait;

/// Acquires and refreshes the access token attached to outgoing requests.
///
/// Implementations own the token cache. They must tolerate concurrent calls to both
/// operations coming from independent in-flight requests.
#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// Returns the currently cached token, acquiring one first if needed.
    ///
    /// Fails with [`Error::NoCredentials`] if there is nothing cached and no way to get a token.
    async fn get_token(&self) -> Result<Token, Error>;

    /// Forces the acquisition of a new token, replacing the cached one on success.
    ///
    /// On failure the cached token is left untouched.
    async fn refresh_token(&self) -> Result<Token, Error>;

    /// Refreshes the token after the server refused `rejected`.
    ///
    /// Providers caching a newer token than `rejected` may return it without refreshing again.
    /// Defaults to [`refresh_token`](TokenProvider::refresh_token).
    async fn refresh_rejected(&self, rejected: &Token) -> Result<Token, Error> {
        let _ = rejected;
        self.refresh_token().await
    }

    /// Whether [`refresh_token`](TokenProvider::refresh_token) can ever succeed.
    ///
    /// Calls authenticated by a provider that can't refresh give up on the first authorization failure.
    fn can_refresh(&self) -> bool {
        true
    }
}

/// Provider for a fixed, long-lived token such as a personal access token.
#[derive(Clone, Debug)]
pub struct StaticTokenProvider {
    token: Option<Token>,
}

impl StaticTokenProvider {
    /// Always hands out the given token.
    pub fn new(token: impl Into<Token>) -> Self {
        Self {
            token: Some(token.into()),
        }
    }

    /// A provider without any credential.
    pub fn empty() -> Self {
        Self { token: None }
    }
}

#[async_trait]
impl TokenProvider for StaticTokenProvider {
    async fn get_token(&self) -> Result<Token, Error> {
        self.token.clone().ok_or(Error::NoCredentials)
    }

    async fn refresh_token(&self) -> Result<Token, Error> {
        Err(Error::RefreshFailed(Box::new(Error::NoCredentials)))
    }

    fn can_refresh(&self) -> bool {
        false
    }
}

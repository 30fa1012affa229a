//! Credentials and tokens.

use chrono::{DateTime, Utc};
use reqwest::header::HeaderValue;
use secrecy::{ExposeSecret, Secret};
use serde::{Deserialize, Serialize};
use std::ops::Deref;

/// Credentials exchanged at the token endpoint for an access token.
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(tag = "grant_type", rename_all = "snake_case")]
pub enum Credentials {
    AuthorizationCode {
        client_id: String,
        client_secret: Token,
        code: String,
        redirect_uri: String,
    },
    RefreshToken {
        client_id: String,
        client_secret: Token,
        refresh_token: Token,
    },
    ClientCredentials {
        client_id: String,
        client_secret: Token,
        scope: String,
    },
}

impl Credentials {
    /// Returns a reference to the client id stored in these [`Credentials`].
    pub fn client_id(&self) -> &str {
        match self {
            Credentials::AuthorizationCode { client_id, .. }
            | Credentials::RefreshToken { client_id, .. }
            | Credentials::ClientCredentials { client_id, .. } => client_id,
        }
    }

    /// Returns a reference to the client secret stored in these [`Credentials`].
    pub fn client_secret(&self) -> &Token {
        match self {
            Credentials::AuthorizationCode { client_secret, .. }
            | Credentials::RefreshToken { client_secret, .. }
            | Credentials::ClientCredentials { client_secret, .. } => client_secret,
        }
    }

    /// Returns a reference to the refresh token stored in these [`Credentials`].
    ///
    /// Returns `None` if the credential is not of type `RefreshToken`.
    pub fn refresh_token(&self) -> Option<&Token> {
        match self {
            Credentials::RefreshToken { refresh_token, .. } => Some(refresh_token),
            _ => None,
        }
    }
}

/// Opaque access token used to authorize requests.
#[derive(Clone, Debug)]
pub struct AccessToken {
    pub(crate) token: Token,
    pub(crate) expires_at: Option<DateTime<Utc>>,
}

impl AccessToken {
    /// Creates a new access token, optionally expiring at the given instant.
    pub fn new(token: impl Into<Token>, expires_at: Option<DateTime<Utc>>) -> Self {
        Self {
            token: token.into(),
            expires_at,
        }
    }

    /// Actual token contents held by this `AccessToken` instance.
    pub fn token(&self) -> &Token {
        &self.token
    }

    /// Expiration date of the token.
    ///
    /// Returns `None` if this token does not expire.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }
}

impl Deref for AccessToken {
    type Target = Token;

    fn deref(&self) -> &Self::Target {
        self.token()
    }
}

/// Wrapper for a secret string that makes it harder to accidentally expose secrets
/// and ensures the backing memory is wiped on drop.
///
/// ```rust
/// # use authed_call::Token;
/// let token = Token::new("supersecret");
///
/// // The secret is redacted when printed with Debug
/// assert!(!format!("{:?}", token).contains("supersecret"));
///
/// // But can be manually exposed calling `expose_secret()`
/// assert_eq!(token.expose_secret(), "supersecret");
/// ```
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct Token(#[serde(serialize_with = "serialize_secret")] Secret<String>);

impl Token {
    /// Wraps a secret string in a new `Token`.
    pub fn new<T: Into<String>>(s: T) -> Self {
        Self(Secret::new(s.into()))
    }

    /// Exposes a reference to the underlying secret string.
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    /// Builds the `Authorization` header value carrying this token as a bearer credential.
    ///
    /// The returned header is marked as sensitive so it never shows up in logs.
    pub fn bearer_header(&self) -> Result<HeaderValue, reqwest::header::InvalidHeaderValue> {
        let mut value = HeaderValue::from_str(&format!("Bearer {}", self.expose_secret()))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl PartialEq for Token {
    fn eq(&self, other: &Self) -> bool {
        self.expose_secret() == other.expose_secret()
    }
}

impl<T> From<T> for Token
where
    T: Into<String>,
{
    fn from(s: T) -> Self {
        Token::new(s)
    }
}

fn serialize_secret<S>(secret: &Secret<String>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: serde::ser::Serializer,
{
    secret.expose_secret().serialize(serializer)
}

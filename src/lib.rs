//! Bearer-authenticated HTTP calls that survive expired access tokens.
//!
//! Every call goes through the same protocol: an access token is requested from a
//! [`TokenProvider`], the request is built with it and sent, and if the server rejects the
//! token (HTTP 401) the token is refreshed once and the request is built and sent again.
//! A second rejection is final, so a permanently invalid credential never causes a refresh loop.
//!
//! # Usage
//!
//! ## Set up a token provider
//!
//! An [`Authenticator`] exchanges OAuth 2.0 credentials for access tokens and keeps them
//! cached until they are about to expire:
//!
//! ```rust,no_run
//! # use authed_call::{Authenticator, Credentials};
//! # use reqwest::Url;
//! # #[tokio::main]
//! # async fn main() {
//! let authenticator = Authenticator::new(
//!     reqwest::Client::new().into(),
//!     Url::parse("https://webexapis.com/v1/access_token").unwrap(),
//!     Some(Credentials::ClientCredentials {
//!         client_id: "some-client-id".into(),
//!         client_secret: "some-client-secret".into(),
//!         scope: "spark:all".into(),
//!     }),
//! );
//! # }
//! ```
//!
//! Long-lived tokens that can't be refreshed go in a [`StaticTokenProvider`].
//!
//! ## Make authenticated calls
//!
//! ```rust,no_run
//! # use authed_call::{ApiClient, Error, StaticTokenProvider};
//! # use std::sync::Arc;
//! #
//! # #[tokio::main]
//! # async fn main() -> Result<(), Error> {
//! let client = ApiClient::new(Arc::new(StaticTokenProvider::new("some-token")));
//!
//! let me: serde_json::Value = client.get_json("people/me").await?;
//! println!("Hello {}", me["displayName"]);
//! # Ok(())
//! # }
//! ```
//!
//! ## Take control of the request and the response
//!
//! Any request can be made authenticated with [`ApiClient::call`], given a function building
//! it from the `Authorization` header and a [`ResponseHandler`]:
//!
//! ```rust,no_run
//! # use authed_call::{ApiClient, EmptyHandler, Error, StaticTokenProvider};
//! # use reqwest::header::{HeaderValue, AUTHORIZATION};
//! # use std::sync::Arc;
//! #
//! # #[tokio::main]
//! # async fn main() -> Result<(), Error> {
//! # let client = ApiClient::new(Arc::new(StaticTokenProvider::new("some-token")));
//! let url = client.url("messages/some-message-id")?;
//! let http = client.http_client().clone();
//!
//! client
//!     .call(move |authorization: HeaderValue| {
//!         http.delete(url.clone()).header(AUTHORIZATION, authorization)
//!     })
//!     .perform(EmptyHandler)
//!     .await?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_debug_implementations)]
#![forbid(unsafe_code)]

pub mod authenticator;
pub mod call;
pub mod client;
pub mod error;
pub mod handler;
mod middlewares;
pub mod token;
pub mod token_provider;

pub use authenticator::Authenticator;
pub use call::{AuthenticatedCall, RequestDescriptor};
pub use client::{ApiClient, ApiClientBuilder};
pub use error::{ApiError, Error};
pub use handler::{EmptyHandler, JsonHandler, ResponseClass, ResponseHandler};
pub use token::{AccessToken, Credentials, Token};
pub use token_provider::{StaticTokenProvider, TokenProvider};

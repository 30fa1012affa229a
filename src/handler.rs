//! Handling of the responses to authenticated calls.

use crate::error::Error;
use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use std::{fmt, marker::PhantomData};

/// Classification of a response to an authenticated call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseClass {
    /// The call succeeded.
    Success,
    /// The server rejected the credential attached to the call.
    Unauthorized,
    /// Any other failure.
    Failure,
}

impl ResponseClass {
    /// Default classification based on the HTTP status code alone.
    pub fn from_status(status: StatusCode) -> Self {
        if status == StatusCode::UNAUTHORIZED {
            ResponseClass::Unauthorized
        } else if status.is_success() {
            ResponseClass::Success
        } else {
            ResponseClass::Failure
        }
    }
}

/// Receives the outcome of an authenticated call.
///
/// One handler serves a whole logical operation, including the retried request if the
/// access token had to be refreshed. Exactly one of its `handle_*` methods is invoked,
/// and only when a request was actually issued.
#[async_trait]
pub trait ResponseHandler: Send + Sync {
    type Output: Send;

    /// Decides whether a response is a success, an authorization failure or any other failure.
    fn classify(&self, response: &Response) -> ResponseClass {
        ResponseClass::from_status(response.status())
    }

    /// Handles a response classified as [`ResponseClass::Success`].
    async fn handle_success(&self, response: Response) -> Result<Self::Output, Error>;

    /// Handles any failure that is not recovered by refreshing the access token.
    ///
    /// By default the error is returned to the caller as is.
    async fn handle_failure(&self, error: Error) -> Result<Self::Output, Error> {
        Err(error)
    }
}

/// Handler deserializing the body of a successful response as JSON.
pub struct JsonHandler<T> {
    _marker: PhantomData<fn() -> T>,
}

impl<T> JsonHandler<T> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<T> Default for JsonHandler<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for JsonHandler<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonHandler").finish()
    }
}

#[async_trait]
impl<T> ResponseHandler for JsonHandler<T>
where
    T: DeserializeOwned + Send,
{
    type Output = T;

    async fn handle_success(&self, response: Response) -> Result<T, Error> {
        Ok(response.json().await?)
    }
}

/// Handler for calls whose successful responses carry nothing of interest.
#[derive(Debug, Default, Clone, Copy)]
pub struct EmptyHandler;

#[async_trait]
impl ResponseHandler for EmptyHandler {
    type Output = ();

    async fn handle_success(&self, _response: Response) -> Result<(), Error> {
        Ok(())
    }
}

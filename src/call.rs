//! Bearer-authenticated calls with a single refresh-and-retry on authorization failure.

use crate::{
    error::{ApiError, Error},
    handler::{ResponseClass, ResponseHandler},
    token::Token,
    token_provider::TokenProvider,
};
use reqwest::{header::HeaderValue, Response};
use reqwest_middleware::RequestBuilder;
use std::{
    fmt::{Debug, Formatter},
    sync::Arc,
};
use tokio::task::JoinHandle;

/// Builds the request of an authenticated call out of an `Authorization` header value.
///
/// A descriptor is invoked again, with the new header, every time the access token changes:
/// a request that has been sent can't be sent a second time.
///
/// Any `Fn(HeaderValue) -> RequestBuilder` closure is a descriptor.
pub trait RequestDescriptor: Send + Sync {
    /// Builds a new request carrying the given `Authorization` header.
    fn build(&self, authorization: HeaderValue) -> RequestBuilder;

    /// Notifies that no request will be sent, because no access token could be obtained.
    ///
    /// Only invoked for calls configured with
    /// [`notify_on_prepare_failure`](AuthenticatedCall::notify_on_prepare_failure).
    fn prepare_failed(&self) {}

    /// Attaches a callback to run whenever the request could not be prepared.
    fn on_prepare_failed<N>(self, notify: N) -> OnPrepareFailed<Self, N>
    where
        Self: Sized,
        N: Fn() + Send + Sync,
    {
        OnPrepareFailed {
            descriptor: self,
            notify,
        }
    }
}

impl<F> RequestDescriptor for F
where
    F: Fn(HeaderValue) -> RequestBuilder + Send + Sync,
{
    fn build(&self, authorization: HeaderValue) -> RequestBuilder {
        self(authorization)
    }
}

/// Descriptor with a prepare-failure callback, see [`RequestDescriptor::on_prepare_failed`].
pub struct OnPrepareFailed<D, N> {
    descriptor: D,
    notify: N,
}

impl<D, N> RequestDescriptor for OnPrepareFailed<D, N>
where
    D: RequestDescriptor,
    N: Fn() + Send + Sync,
{
    fn build(&self, authorization: HeaderValue) -> RequestBuilder {
        self.descriptor.build(authorization)
    }

    fn prepare_failed(&self) {
        (self.notify)()
    }
}

impl<D, N> Debug for OnPrepareFailed<D, N> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OnPrepareFailed").finish_non_exhaustive()
    }
}

/// A single logical call authenticated with a bearer token.
///
/// The call goes through these stages:
/// 1. an access token is requested from the [`TokenProvider`];
/// 2. the request is built with that token and sent;
/// 3. if the server rejects the token, the provider is asked to refresh it once;
/// 4. the request is built again with the refreshed token and sent one last time.
///
/// Failures to obtain a usable token ([`Error::NoCredentials`], [`Error::RefreshFailed`],
/// [`Error::TokenUnavailable`]) are returned straight to the caller without involving the
/// [`ResponseHandler`]. Every other outcome,
/// including a second authorization failure after a refresh, goes through the handler.
pub struct AuthenticatedCall<D> {
    token_provider: Arc<dyn TokenProvider>,
    descriptor: D,
    notify_on_prepare_failure: bool,
}

impl<D> Debug for AuthenticatedCall<D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthenticatedCall")
            .field("notify_on_prepare_failure", &self.notify_on_prepare_failure)
            .finish_non_exhaustive()
    }
}

/// Stages of an authenticated call. `Done` is reached by returning from the loop.
enum Stage {
    AwaitingToken,
    Requesting(Token),
    /// Holds the token refused by the server.
    AwaitingRefresh(Token),
    Retrying(Token),
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::AwaitingToken => "awaiting_token",
            Stage::Requesting(_) => "requesting",
            Stage::AwaitingRefresh(_) => "awaiting_refresh",
            Stage::Retrying(_) => "retrying",
        }
    }
}

/// What came back from sending one request.
enum Outcome {
    Success(Response),
    Unauthorized(Response),
    Failure(Response),
    TransportFailure(Error),
}

impl<D> AuthenticatedCall<D>
where
    D: RequestDescriptor,
{
    /// Prepares a new call whose requests are built by `descriptor`.
    pub fn new(token_provider: Arc<dyn TokenProvider>, descriptor: D) -> Self {
        Self {
            token_provider,
            descriptor,
            notify_on_prepare_failure: false,
        }
    }

    /// If set, [`RequestDescriptor::prepare_failed`] is invoked when no request will be sent
    /// because an access token could not be obtained or refreshed.
    pub fn notify_on_prepare_failure(mut self, notify: bool) -> Self {
        self.notify_on_prepare_failure = notify;
        self
    }

    /// Runs the call to completion, returning exactly one outcome.
    #[tracing::instrument(name = "Authenticated Call", skip_all)]
    pub async fn perform<H>(self, handler: H) -> Result<H::Output, Error>
    where
        H: ResponseHandler,
    {
        let mut stage = Stage::AwaitingToken;

        loop {
            tracing::debug!(stage = stage.name(), "Authenticated call stage");

            stage = match stage {
                Stage::AwaitingToken => match self.token_provider.get_token().await {
                    Ok(token) => Stage::Requesting(token),
                    Err(e) => return Err(self.auth_failed(e)),
                },
                Stage::Requesting(token) => {
                    match self.send(&token, &handler).await {
                        Ok(Outcome::Unauthorized(_)) if self.token_provider.can_refresh() => {
                            tracing::info!("Access token rejected, refreshing it");
                            Stage::AwaitingRefresh(token)
                        }
                        Ok(Outcome::Unauthorized(response)) => {
                            let e = match ApiError::from_response(response).await {
                                Ok(api_error) => Error::AuthorizationFailed(api_error),
                                Err(e) => e,
                            };
                            return Err(self.auth_failed(e));
                        }
                        Ok(outcome) => return deliver(&handler, outcome).await,
                        Err(e) => return Err(self.auth_failed(e)),
                    }
                }
                Stage::AwaitingRefresh(rejected) => match self
                    .token_provider
                    .refresh_rejected(&rejected)
                    .await
                {
                    Ok(token) => Stage::Retrying(token),
                    Err(e) => return Err(self.auth_failed(e.into_refresh_failure())),
                },
                Stage::Retrying(token) => {
                    return match self.send(&token, &handler).await {
                        Ok(outcome) => deliver(&handler, outcome).await,
                        Err(e) => Err(self.auth_failed(e)),
                    };
                }
            };
        }
    }

    /// Runs the call on a background task.
    ///
    /// The call runs to completion even if the returned handle is dropped.
    pub fn spawn<H>(self, handler: H) -> JoinHandle<Result<H::Output, Error>>
    where
        D: 'static,
        H: ResponseHandler + 'static,
        H::Output: 'static,
    {
        tokio::spawn(self.perform(handler))
    }

    /// Builds a fresh request for `token` and sends it.
    ///
    /// Fails only if the request could not be built, in which case nothing was sent.
    async fn send<H>(&self, token: &Token, handler: &H) -> Result<Outcome, Error>
    where
        H: ResponseHandler,
    {
        let authorization = token.bearer_header().map_err(|e| {
            Error::Other(anyhow::Error::new(e).context("Access token is not a valid header value"))
        })?;

        let outcome = match self.descriptor.build(authorization).send().await {
            Ok(response) => match handler.classify(&response) {
                ResponseClass::Success => Outcome::Success(response),
                ResponseClass::Unauthorized => Outcome::Unauthorized(response),
                ResponseClass::Failure => Outcome::Failure(response),
            },
            Err(e) => Outcome::TransportFailure(e.into()),
        };

        Ok(outcome)
    }

    /// Terminates the call on the auth-failure channel.
    ///
    /// The returned error always satisfies [`Error::is_auth_failure`].
    fn auth_failed(&self, e: Error) -> Error {
        if self.notify_on_prepare_failure {
            self.descriptor.prepare_failed();
        }

        tracing::warn!("Authenticated call failed without a usable access token: {}", e);
        e.into_auth_failure()
    }
}

/// Hands the outcome of a sent request over to the handler.
///
/// Authorization failures of the first request never get here, so an unauthorized outcome is
/// always the retried request being rejected again.
async fn deliver<H>(handler: &H, outcome: Outcome) -> Result<H::Output, Error>
where
    H: ResponseHandler,
{
    match outcome {
        Outcome::Success(response) => handler.handle_success(response).await,
        Outcome::Unauthorized(response) => {
            tracing::warn!("Access token rejected again after a refresh");

            let e = match ApiError::from_response(response).await {
                Ok(api_error) => Error::AuthorizationFailed(api_error),
                Err(e) => e,
            };
            handler.handle_failure(e).await
        }
        Outcome::Failure(response) => {
            tracing::debug!("Failed HTTP request. Status code: {}", response.status());

            let e = match ApiError::from_response(response).await {
                Ok(api_error) => Error::ApiError(api_error),
                Err(e) => e,
            };
            handler.handle_failure(e).await
        }
        Outcome::TransportFailure(e) => handler.handle_failure(e).await,
    }
}

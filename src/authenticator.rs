use crate::{
    error::{ApiError, Error},
    token::{AccessToken, Credentials, Token},
    token_provider::TokenProvider,
};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use reqwest::Url;
use reqwest_middleware::ClientWithMiddleware;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use tokio::sync::{mpsc, oneshot};

type Reply = oneshot::Sender<Result<Token, Error>>;

enum Command {
    GetToken(Reply),
    Refresh {
        /// Token generation the caller observed when it asked for a refresh.
        observed_generation: u64,
        /// Token refused by the server, if the refresh was caused by one.
        rejected: Option<Token>,
        reply: Reply,
    },
}

/// [`TokenProvider`] exchanging [`Credentials`] for access tokens at an OAuth 2.0 token endpoint.
///
/// All the operations are serialized through a single background task owning the token cache,
/// so concurrent callers never race on it.
#[derive(Debug, Clone)]
pub struct Authenticator {
    tx: mpsc::UnboundedSender<Command>,
    generation: Arc<AtomicU64>,
    can_refresh: bool,
}

impl Authenticator {
    /// Starts a new authenticator with the given initial credentials.
    ///
    /// Without credentials, the authenticator has no way to obtain tokens and every
    /// [`get_token`](TokenProvider::get_token) fails with [`Error::NoCredentials`].
    pub fn new(
        client: ClientWithMiddleware,
        token_url: Url,
        credentials: Option<Credentials>,
    ) -> Self {
        Self::start(client, token_url, credentials, None)
    }

    /// Starts a new authenticator seeded with an already issued access token.
    ///
    /// The token is handed out until it expires or a refresh is requested, at which point the
    /// credentials (if any) are exchanged for a new one.
    pub fn with_access_token(
        client: ClientWithMiddleware,
        token_url: Url,
        credentials: Option<Credentials>,
        access_token: AccessToken,
    ) -> Self {
        Self::start(client, token_url, credentials, Some(access_token))
    }

    fn start(
        client: ClientWithMiddleware,
        token_url: Url,
        credentials: Option<Credentials>,
        access_token: Option<AccessToken>,
    ) -> Self {
        let generation = Arc::new(AtomicU64::new(0));
        let can_refresh = credentials.is_some();
        let state = AuthenticatorState {
            client,
            token_url,
            credentials,
            access_token,
            generation: generation.clone(),
        };

        // Spawn a long running task which will run until the authenticator is dropped
        let (tx, rx) = mpsc::unbounded_channel();
        #[cfg(test)]
        tests::mocked_time::spawn(async move {
            // We need to propagate the mocked time task-local in order to control time in the tests
            process_loop(state, rx).await;
        });
        #[cfg(not(test))]
        tokio::spawn(async move {
            process_loop(state, rx).await;
        });

        Self {
            tx,
            generation,
            can_refresh,
        }
    }

    async fn send(&self, command: impl FnOnce(Reply) -> Command) -> Result<Token, Error> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(command(tx))
            .map_err(|_| Error::Other(anyhow::anyhow!("Authenticator task is not running")))?;

        rx.await
            .map_err(|_| Error::Other(anyhow::anyhow!("Authenticator task dropped the reply")))?
    }
}

#[async_trait]
impl TokenProvider for Authenticator {
    /// Returns the current access token.
    /// If there's no access token available, or the available one is about to expire, a new one
    /// will be requested from the server using the configured credentials.
    ///
    /// Concurrent calls are batched into one single request to the token endpoint.
    async fn get_token(&self) -> Result<Token, Error> {
        self.send(Command::GetToken).await
    }

    /// Exchanges the credentials for a new access token, even if the cached one looks valid.
    ///
    /// Refreshes queued while another refresh completes reuse its token instead of hitting the
    /// token endpoint again.
    async fn refresh_token(&self) -> Result<Token, Error> {
        let observed_generation = self.generation.load(Ordering::SeqCst);
        self.send(|reply| Command::Refresh {
            observed_generation,
            rejected: None,
            reply,
        })
        .await
    }

    /// Exchanges the credentials for a new access token, unless `rejected` has already been
    /// replaced by a newer token in the meantime.
    async fn refresh_rejected(&self, rejected: &Token) -> Result<Token, Error> {
        let observed_generation = self.generation.load(Ordering::SeqCst);
        let rejected = Some(rejected.clone());
        self.send(|reply| Command::Refresh {
            observed_generation,
            rejected,
            reply,
        })
        .await
    }

    fn can_refresh(&self) -> bool {
        self.can_refresh
    }
}

/// Internal state of the authenticator.
struct AuthenticatorState {
    client: ClientWithMiddleware,
    token_url: Url,
    credentials: Option<Credentials>,
    access_token: Option<AccessToken>,
    /// Bumped every time a new access token is stored.
    generation: Arc<AtomicU64>,
}

async fn process_loop(mut state: AuthenticatorState, mut rx: mpsc::UnboundedReceiver<Command>) {
    // Loop waiting for commands until all the handles are dropped
    while let Some(command) = rx.recv().await {
        let (reply, result) = match command {
            Command::GetToken(reply) => (reply, process_get_token(&mut state).await),
            Command::Refresh {
                observed_generation,
                rejected,
                reply,
            } => (
                reply,
                process_refresh_token(&mut state, observed_generation, rejected).await,
            ),
        };

        if reply.send(result).is_err() {
            tracing::warn!("Receiver dropped before the reply");
        }
    }
}

#[tracing::instrument(name = "Get Access Token", level = "debug", skip(state))]
async fn process_get_token(state: &mut AuthenticatorState) -> Result<Token, Error> {
    if let Some(token) = &state.access_token {
        if !should_refresh_token(token) {
            tracing::debug!("Reusing existing access token");
            return Ok(token.token().clone());
        }

        // Nothing to exchange, let the server decide whether it is still good
        if state.credentials.is_none() {
            tracing::debug!("Access token is about to expire but there are no credentials to renew it");
            return Ok(token.token().clone());
        }
    }

    if state.credentials.is_none() {
        return Err(Error::NoCredentials);
    }

    exchange_credentials(state).await
}

#[tracing::instrument(name = "Refresh Access Token", level = "debug", skip(state, rejected))]
async fn process_refresh_token(
    state: &mut AuthenticatorState,
    observed_generation: u64,
    rejected: Option<Token>,
) -> Result<Token, Error> {
    if let Some(token) = &state.access_token {
        let already_refreshed = state.generation.load(Ordering::SeqCst) > observed_generation
            || rejected.map_or(false, |rejected| rejected != token.token);

        if already_refreshed {
            tracing::debug!("Access token already refreshed by a concurrent request");
            return Ok(token.token().clone());
        }
    }

    if state.credentials.is_none() {
        return Err(Error::NoCredentials.into_refresh_failure());
    }

    exchange_credentials(state)
        .await
        .map_err(Error::into_refresh_failure)
}

/// Posts the current credentials to the token endpoint and stores the resulting access token.
///
/// The cached token is only replaced if the exchange succeeds.
async fn exchange_credentials(state: &mut AuthenticatorState) -> Result<Token, Error> {
    let credentials = state.credentials.as_ref().ok_or(Error::NoCredentials)?;

    let response = state
        .client
        .post(state.token_url.clone())
        .json(credentials)
        .send()
        .await?;

    if !response.status().is_success() {
        tracing::debug!("Token request rejected. Status code: {}", response.status());
        return Err(ApiError::from_response(response).await?.into());
    }

    let res: RawAuthenticationResponse = response.json().await?;

    if !res.token_type.eq_ignore_ascii_case("bearer") {
        return Err(Error::Other(anyhow::anyhow!(
            "Unsupported access token type: {}",
            res.token_type,
        )));
    }

    let token = AccessToken {
        token: res.access_token.into(),
        expires_at: res.expires_in.map(|secs| now() + Duration::seconds(secs)),
    };
    state.access_token = Some(token.clone());
    state.generation.fetch_add(1, Ordering::SeqCst);

    tracing::info!("Got new access token");

    // If a refresh token has been provided, use that for subsequent refreshes of the access token
    if let Some(refresh_token) = res.refresh_token {
        state.credentials = state
            .credentials
            .take()
            .map(|credentials| Credentials::RefreshToken {
                client_id: credentials.client_id().to_string(),
                client_secret: credentials.client_secret().clone(),
                refresh_token: refresh_token.into(),
            });

        tracing::info!("Switching to refresh token for subsequent authentication requests");
    }

    Ok(token.token)
}

/// Returns `true` if the token is close to expiration (10 minutes before actual expiration)
/// and should be refreshed. If this token does not expire, this function always returns `false`.
fn should_refresh_token(token: &AccessToken) -> bool {
    token
        .expires_at
        .map_or(false, |expires_at| now() >= expires_at - Duration::minutes(10))
}

// Select an implementation of `now()` depending on whether we are testing or not
#[cfg(not(test))]
fn now() -> chrono::DateTime<Utc> {
    Utc::now()
}
#[cfg(test)]
use tests::mocked_time::now;

/// Successful response of a token request.
#[derive(serde::Deserialize)]
struct RawAuthenticationResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
    token_type: String,
}

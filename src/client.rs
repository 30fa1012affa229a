//! Module containing the API client issuing authenticated calls.

use crate::{
    call::{AuthenticatedCall, RequestDescriptor},
    error::Error,
    handler::{EmptyHandler, JsonHandler},
    middlewares::default_headers::DefaultHeadersMiddleware,
    token_provider::TokenProvider,
};
use reqwest::{
    header::{HeaderMap, HeaderValue, AUTHORIZATION},
    Url,
};
use reqwest_middleware::{ClientWithMiddleware, Middleware};
use reqwest_tracing::{DefaultSpanBackend, TracingMiddleware};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt::{Debug, Formatter},
    sync::Arc,
};

static DEFAULT_BASE_URL: &str = "https://webexapis.com/v1/";

/// Client for a bearer-authenticated REST API.
///
/// Every call made through this client gets an access token from the configured
/// [`TokenProvider`], and is retried once with a refreshed token if the server rejects it.
#[derive(Debug, Clone)]
pub struct ApiClient {
    inner: Arc<ApiClientInner>,
}

struct ApiClientInner {
    client: ClientWithMiddleware,
    base_url: Url,
    token_provider: Arc<dyn TokenProvider>,
}

impl Debug for ApiClientInner {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClientInner")
            .field("base_url", &self.base_url.as_str())
            .finish_non_exhaustive()
    }
}

impl ApiClient {
    /// Builds a new [`ApiClient`] with the default configuration.
    pub fn new(token_provider: Arc<dyn TokenProvider>) -> ApiClient {
        ApiClientBuilder::new(token_provider).build()
    }

    /// Returns a new builder to configure a new [`ApiClient`].
    pub fn builder(token_provider: Arc<dyn TokenProvider>) -> ApiClientBuilder {
        ApiClientBuilder::new(token_provider)
    }

    /// The HTTP client, with all the configured middlewares, used to send requests.
    pub fn http_client(&self) -> &ClientWithMiddleware {
        &self.inner.client
    }

    /// The provider of the access tokens attached to the requests.
    pub fn token_provider(&self) -> &Arc<dyn TokenProvider> {
        &self.inner.token_provider
    }

    /// Resolves `path` against the base URL.
    ///
    /// Relative paths (`messages`) are appended to the base URL, absolute ones (`/messages`)
    /// replace its path.
    pub fn url(&self, path: &str) -> Result<Url, Error> {
        Ok(self.inner.base_url.join(path)?)
    }

    /// Prepares an authenticated call whose requests are built by `descriptor`.
    pub fn call<D>(&self, descriptor: D) -> AuthenticatedCall<D>
    where
        D: RequestDescriptor,
    {
        AuthenticatedCall::new(self.inner.token_provider.clone(), descriptor)
    }

    /// Sends an authenticated `GET` and deserializes the JSON response.
    #[tracing::instrument(name = "GET", skip(self))]
    pub async fn get_json<T>(&self, path: &str) -> Result<T, Error>
    where
        T: DeserializeOwned + Send,
    {
        let url = self.url(path)?;
        let client = self.inner.client.clone();

        self.call(move |authorization: HeaderValue| {
            client.get(url.clone()).header(AUTHORIZATION, authorization)
        })
        .perform(JsonHandler::new())
        .await
    }

    /// Sends an authenticated `POST` with a JSON body and deserializes the JSON response.
    #[tracing::instrument(name = "POST", skip(self, body))]
    pub async fn post_json<B, T>(&self, path: &str, body: &B) -> Result<T, Error>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned + Send,
    {
        let url = self.url(path)?;
        let client = self.inner.client.clone();
        // Serialized once, a retried request sends the same body
        let body = serde_json::to_value(body).map_err(|e| Error::Other(e.into()))?;

        self.call(move |authorization: HeaderValue| {
            client
                .post(url.clone())
                .header(AUTHORIZATION, authorization)
                .json(&body)
        })
        .perform(JsonHandler::new())
        .await
    }

    /// Sends an authenticated `DELETE`.
    #[tracing::instrument(name = "DELETE", skip(self))]
    pub async fn delete(&self, path: &str) -> Result<(), Error> {
        let url = self.url(path)?;
        let client = self.inner.client.clone();

        self.call(move |authorization: HeaderValue| {
            client.delete(url.clone()).header(AUTHORIZATION, authorization)
        })
        .perform(EmptyHandler)
        .await
    }
}

/// Builder for an [`ApiClient`].
pub struct ApiClientBuilder {
    client: reqwest::Client,
    base_url: Url,
    token_provider: Arc<dyn TokenProvider>,
    default_headers: HeaderMap,
    default_middlewares: bool,
    middlewares: Vec<Arc<dyn Middleware>>,
}

impl Debug for ApiClientBuilder {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiClientBuilder")
            .field("base_url", &self.base_url.as_str())
            .field("default_headers", &self.default_headers)
            .field("default_middlewares", &self.default_middlewares)
            .field("middlewares", &self.middlewares.len())
            .finish_non_exhaustive()
    }
}

impl ApiClientBuilder {
    /// Creates a new builder to configure an [`ApiClient`].
    pub fn new(token_provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
            token_provider,
            default_headers: DefaultHeadersMiddleware::default_headers(),
            default_middlewares: true,
            middlewares: Vec::new(),
        }
    }

    /// Consumes the builder and builds a new [`ApiClient`].
    pub fn build(self) -> ApiClient {
        let mut builder = reqwest_middleware::ClientBuilder::new(self.client);

        if self.default_middlewares {
            builder = builder
                .with(TracingMiddleware::<DefaultSpanBackend>::default())
                .with(DefaultHeadersMiddleware::new(self.default_headers));
        }

        for middleware in self.middlewares {
            builder = builder.with_arc(middleware);
        }

        ApiClient {
            inner: Arc::new(ApiClientInner {
                client: builder.build(),
                base_url: self.base_url,
                token_provider: self.token_provider,
            }),
        }
    }

    /// Sets a specific reqwest [`Client`](reqwest::Client) to use.
    ///
    /// Timeouts and connection pooling are configured on this client.
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.client = client;
        self
    }

    /// Sets the base URL all the paths are resolved against.
    ///
    /// Defaults to: `https://webexapis.com/v1/`
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    /// Adds a header sent with every request, replacing any default header with the same name.
    pub fn with_default_header(
        mut self,
        name: reqwest::header::HeaderName,
        value: HeaderValue,
    ) -> Self {
        self.default_headers.insert(name, value);
        self
    }

    /// Appends a middleware, run after the default ones.
    pub fn with_middleware<M>(mut self, middleware: M) -> Self
    where
        M: Middleware,
    {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    /// Drops the default tracing and default headers middlewares, leaving only the ones
    /// added with [`with_middleware`](ApiClientBuilder::with_middleware).
    pub fn without_default_middlewares(mut self) -> Self {
        self.default_middlewares = false;
        self
    }
}

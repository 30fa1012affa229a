use async_trait::async_trait;
use reqwest::{
    header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT},
    Request, Response,
};
use reqwest_middleware::{Middleware, Next};
use task_local_extensions::Extensions;

/// Middleware to inject a set of default headers into all outgoing requests.
///
/// Headers already set on a request are left untouched.
#[derive(Debug)]
pub struct DefaultHeadersMiddleware {
    headers: HeaderMap,
}

impl DefaultHeadersMiddleware {
    pub fn new(headers: HeaderMap) -> Self {
        Self { headers }
    }

    /// `User-Agent` and `Accept` headers sent unless configured otherwise.
    pub fn default_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!(
                env!("CARGO_PKG_NAME"),
                "/",
                env!("CARGO_PKG_VERSION")
            )),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers
    }
}

#[async_trait]
impl Middleware for DefaultHeadersMiddleware {
    async fn handle(
        &self,
        mut req: Request,
        extensions: &mut Extensions,
        next: Next<'_>,
    ) -> reqwest_middleware::Result<Response> {
        for (name, value) in &self.headers {
            if !req.headers().contains_key(name) {
                req.headers_mut().insert(name.clone(), value.clone());
            }
        }

        next.run(req, extensions).await
    }
}

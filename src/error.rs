//! Standard errors used by all functions in the crate.

use reqwest::Response;
use std::{collections::HashMap, fmt};

/// Header carrying the server-side trace identifier of a request, if the API sets one.
pub(crate) static TRACKING_ID_HEADER: &str = "TrackingID";

/// Error collecting all possible failures of an authenticated call.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The token provider has no cached token and no way to obtain one.
    #[error("No credentials available to obtain an access token")]
    NoCredentials,
    /// A token refresh was attempted and the credential exchange was rejected or unreachable.
    #[error("Access token refresh failed: {0}")]
    RefreshFailed(#[source] Box<Error>),
    /// No usable access token could be attached to the request.
    ///
    /// Wraps the underlying failure, such as a rejected credential exchange or a token the
    /// server refused when there was no way to refresh it.
    #[error("No usable access token: {0}")]
    TokenUnavailable(#[source] Box<Error>),
    /// The server rejected the credential attached to the request.
    #[error("Authorization failed: {0}")]
    AuthorizationFailed(ApiError),
    /// Network or protocol error unrelated to authorization.
    #[error("HTTP error: {0}")]
    TransportFailure(#[from] reqwest::Error),
    /// Non-success response returned by an API endpoint.
    #[error("{0}")]
    ApiError(#[from] ApiError),
    /// A URL could not be built from the configured base URL.
    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    /// Catch-all variant for unexpected errors.
    #[error(transparent)]
    Other(anyhow::Error),
}

impl Error {
    /// Returns `true` if no usable credential could be obtained, so no response handler
    /// was ever involved.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            self,
            Error::NoCredentials | Error::RefreshFailed(_) | Error::TokenUnavailable(_)
        )
    }

    /// Classifies an error ending a call before any handler was involved.
    pub(crate) fn into_auth_failure(self) -> Self {
        if self.is_auth_failure() {
            self
        } else {
            Error::TokenUnavailable(Box::new(self))
        }
    }

    /// Wraps an error returned by a refresh attempt, keeping already-classified ones as they are.
    pub(crate) fn into_refresh_failure(self) -> Self {
        match self {
            e @ Error::RefreshFailed(_) => e,
            e => Error::RefreshFailed(Box::new(e)),
        }
    }
}

impl From<reqwest_middleware::Error> for Error {
    fn from(e: reqwest_middleware::Error) -> Self {
        match e {
            reqwest_middleware::Error::Reqwest(e) => Error::TransportFailure(e),
            reqwest_middleware::Error::Middleware(e) => {
                e.downcast::<Error>().unwrap_or_else(Error::Other)
            }
        }
    }
}

impl From<Error> for reqwest_middleware::Error {
    fn from(e: Error) -> Self {
        reqwest_middleware::Error::Middleware(e.into())
    }
}

/// HTTP error response returned by an API.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP status returned by the server.
    pub status: u16,
    /// Concise description of the error.
    pub title: String,
    /// A human readable explanation specific to this occurrence of the problem.
    pub detail: Option<String>,
    /// Server trace identifier for the request.
    pub trace_id: Option<String>,
    /// Optional additional details, keyed by the field they refer to.
    pub errors: HashMap<String, Vec<String>>,
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP error {}: {}", self.status, self.title)?;

        if let Some(ref detail) = self.detail {
            write!(f, "\nAdditional details: {}", detail)?;
        }

        if let Some(ref trace_id) = self.trace_id {
            write!(f, "\nTrace ID: {}", trace_id)?;
        }

        if !self.errors.is_empty() {
            write!(f, "\nAll errors:")?;
            for (k, v) in &self.errors {
                write!(f, "\n- {}: {}", k, v.join(", "))?;
            }
        }

        Ok(())
    }
}

/// Body of an error response.
#[derive(serde::Deserialize, Debug)]
#[serde(untagged)]
enum ErrorResponseBody {
    /// `{"message": "...", "errors": [{"description": "..."}], "trackingId": "..."}`
    Message {
        message: String,
        #[serde(default)]
        errors: Vec<ErrorDescription>,
        #[serde(rename = "trackingId")]
        tracking_id: Option<String>,
    },
    /// OAuth 2.0 token endpoint error, see RFC 6749 section 5.2.
    OAuth {
        error: String,
        error_description: Option<String>,
    },
    Unknown,
}

#[derive(serde::Deserialize, Debug)]
struct ErrorDescription {
    description: String,
}

impl ApiError {
    /// Consumes a non-success response and builds an [`ApiError`] out of its status and body.
    pub async fn from_response(response: Response) -> Result<ApiError, Error> {
        let status = response.status();
        let header_trace_id = response
            .headers()
            .get(TRACKING_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.to_string());

        let bytes = response.bytes().await?;
        let body: ErrorResponseBody =
            serde_json::from_slice(&bytes).unwrap_or(ErrorResponseBody::Unknown);

        let default_title = status
            .canonical_reason()
            .unwrap_or("server_error")
            .to_string();

        let api_error = match body {
            ErrorResponseBody::Message {
                message,
                errors,
                tracking_id,
            } => ApiError {
                status: status.as_u16(),
                title: default_title,
                detail: Some(message),
                trace_id: tracking_id.or(header_trace_id),
                errors: if errors.is_empty() {
                    HashMap::new()
                } else {
                    [(
                        "errors".to_string(),
                        errors.into_iter().map(|e| e.description).collect(),
                    )]
                    .into_iter()
                    .collect()
                },
            },
            ErrorResponseBody::OAuth {
                error,
                error_description,
            } => ApiError {
                status: status.as_u16(),
                title: error,
                detail: error_description,
                trace_id: header_trace_id,
                errors: HashMap::new(),
            },
            ErrorResponseBody::Unknown => ApiError {
                status: status.as_u16(),
                title: default_title,
                detail: None,
                trace_id: header_trace_id,
                errors: HashMap::new(),
            },
        };

        Ok(api_error)
    }
}

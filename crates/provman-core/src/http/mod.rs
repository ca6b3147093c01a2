//! HTTP client with bounded retries.
//!
//! Every network-backed source talks through [`HttpClient`]. A request is
//! retried only when the server could not be reached or answered with a 5xx
//! status. A 404 is a definitive "not here" and any other status or an
//! unparsable body is a malformed answer; neither is retried. When the
//! attempts run out the error reports how many were actually made.

pub mod retry;

use std::future::Future;
use std::time::Duration;

use futures::StreamExt;
use provman_schema::ProviderAddress;
use reqwest::header::{ACCEPT, HeaderMap};
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn};

pub use retry::RetryPolicy;

use crate::error::Error;

/// Failure of a single HTTP exchange, before provider context is attached.
#[derive(Error, Debug)]
pub enum HttpError {
    #[error("{url} returned 404 Not Found")]
    NotFound { url: String },

    #[error("{url} returned unexpected status {status}")]
    Status { url: String, status: u16 },

    #[error("could not reach {url}: {detail}")]
    Unreachable { url: String, detail: String },

    #[error("request to {url} failed: {detail}; giving up after {attempts} attempt(s)")]
    Exhausted {
        url: String,
        attempts: u32,
        detail: String,
    },

    #[error("invalid response from {url}: {detail}")]
    Malformed { url: String, detail: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HttpError {
    /// True for failures worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }

    /// Attach the provider being resolved.
    pub fn for_provider(self, provider: &ProviderAddress) -> Error {
        match self {
            Self::NotFound { url } => Error::not_found(provider, format!("not found at {url}")),
            Self::Status { url, status } => {
                Error::malformed(url, format!("unexpected HTTP status {status}"))
            }
            Self::Unreachable { url, detail } => Error::Unreachable { url, detail },
            Self::Exhausted {
                url,
                attempts,
                detail,
            } => Error::ExhaustedRetries {
                url,
                attempts,
                detail,
            },
            Self::Malformed { url, detail } => Error::Malformed {
                location: url,
                detail,
            },
            Self::Io(e) => Error::Io(e),
        }
    }
}

/// A fully-read response body.
#[derive(Debug, Clone)]
pub struct Fetched {
    /// Final URL after redirects.
    pub url: Url,
    /// Response headers.
    pub headers: HeaderMap,
    /// Response body.
    pub body: Vec<u8>,
}

/// `reqwest` client plus the retry policy applied to every request.
#[derive(Debug, Clone)]
pub struct HttpClient {
    client: Client,
    policy: RetryPolicy,
}

impl HttpClient {
    /// Client for API requests: `timeout` bounds each whole request.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the TLS backend cannot be initialised.
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Result<Self, Error> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, policy })
    }

    /// Client for package downloads: `timeout` bounds connecting only, so
    /// large archives are not cut off mid-stream.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the TLS backend cannot be initialised.
    pub fn for_downloads(timeout: Duration, policy: RetryPolicy) -> Result<Self, Error> {
        let client = Client::builder()
            .user_agent(crate::USER_AGENT)
            .connect_timeout(timeout)
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client, policy })
    }

    /// Same connection pool, different retry policy.
    pub fn with_policy(&self, policy: RetryPolicy) -> Self {
        Self {
            client: self.client.clone(),
            policy,
        }
    }

    /// The retry policy in effect.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Run `op` until it succeeds, fails for good, or attempts run out.
    ///
    /// # Errors
    ///
    /// Returns the first non-retryable error, or [`HttpError::Exhausted`]
    /// carrying the number of attempts made.
    pub async fn retrying<T, F, Fut>(&self, url: &Url, mut op: F) -> Result<T, HttpError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, HttpError>>,
    {
        let max_attempts = self.policy.attempts();
        let mut last_detail = String::new();

        for attempt in 0..max_attempts {
            let delay = self.policy.backoff(attempt);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match op().await {
                Ok(value) => return Ok(value),
                Err(HttpError::Unreachable { detail, .. }) => {
                    warn!(
                        %url,
                        attempt = attempt + 1,
                        max_attempts,
                        %detail,
                        "request failed"
                    );
                    last_detail = detail;
                }
                Err(e) => return Err(e),
            }
        }

        Err(HttpError::Exhausted {
            url: url.to_string(),
            attempts: max_attempts,
            detail: last_detail,
        })
    }

    /// One GET, classified by status. No retries.
    ///
    /// # Errors
    ///
    /// Transport failures and 5xx map to [`HttpError::Unreachable`], 404 to
    /// [`HttpError::NotFound`], other non-2xx to [`HttpError::Status`].
    pub async fn send_once(&self, url: &Url, accept: Option<&str>) -> Result<Response, HttpError> {
        debug!(%url, "GET");
        let mut req = self.client.get(url.clone());
        if let Some(accept) = accept {
            req = req.header(ACCEPT, accept);
        }
        let resp = req.send().await.map_err(|e| HttpError::Unreachable {
            url: url.to_string(),
            detail: e.to_string(),
        })?;

        let status = resp.status();
        if status.is_success() {
            Ok(resp)
        } else if status == StatusCode::NOT_FOUND {
            Err(HttpError::NotFound {
                url: url.to_string(),
            })
        } else if status.is_server_error() {
            Err(HttpError::Unreachable {
                url: url.to_string(),
                detail: format!("server returned {status}"),
            })
        } else {
            Err(HttpError::Status {
                url: url.to_string(),
                status: status.as_u16(),
            })
        }
    }

    /// GET with retries, reading the whole body.
    ///
    /// Bodies larger than `limit` bytes are rejected as malformed.
    ///
    /// # Errors
    ///
    /// See [`HttpClient::retrying`] and [`HttpClient::send_once`].
    pub async fn fetch(
        &self,
        url: &Url,
        accept: Option<&str>,
        limit: Option<u64>,
    ) -> Result<Fetched, HttpError> {
        self.retrying(url, move || async move {
            let resp = self.send_once(url, accept).await?;
            if let (Some(limit), Some(len)) = (limit, resp.content_length()) {
                if len > limit {
                    return Err(HttpError::Malformed {
                        url: url.to_string(),
                        detail: format!("response of {len} bytes exceeds the {limit} byte limit"),
                    });
                }
            }
            let final_url = resp.url().clone();
            let headers = resp.headers().clone();

            // Content-Length may be absent (chunked), so count while reading.
            let mut body = Vec::new();
            let mut stream = resp.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.map_err(|e| HttpError::Unreachable {
                    url: url.to_string(),
                    detail: format!("reading response body: {e}"),
                })?;
                body.extend_from_slice(&chunk);
                if let Some(limit) = limit {
                    if body.len() as u64 > limit {
                        return Err(HttpError::Malformed {
                            url: url.to_string(),
                            detail: format!("response exceeds the {limit} byte limit"),
                        });
                    }
                }
            }
            Ok(Fetched {
                url: final_url,
                headers,
                body,
            })
        })
        .await
    }

    /// GET with retries and decode a JSON body.
    ///
    /// Returns the decoded value and the final URL, which relative links in
    /// the document are resolved against.
    ///
    /// # Errors
    ///
    /// Returns [`HttpError::Malformed`] if the body is not the expected JSON.
    pub async fn fetch_json<T: DeserializeOwned>(&self, url: &Url) -> Result<(T, Url), HttpError> {
        let fetched = self.fetch(url, Some("application/json"), None).await?;
        let value = serde_json::from_slice(&fetched.body).map_err(|e| HttpError::Malformed {
            url: url.to_string(),
            detail: e.to_string(),
        })?;
        Ok((value, fetched.url))
    }
}

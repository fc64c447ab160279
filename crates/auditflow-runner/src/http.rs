//! HTTP client with typed retry.
//!
//! The remote API is consumed through exactly one primitive: POST a JSON
//! body with a bearer token and get back a JSON array. Every failure is
//! classified before the retry loop decides what to do with it:
//!
//! - [`ApiError::FatalAuth`]: 401/403; never retried, aborts the run
//! - [`ApiError::Retryable`]: 429, 5xx, network errors and timeouts;
//!   retried on the shared schedule and surfaced once the budget is spent
//! - [`ApiError::BadShape`]: 2xx with a body that is not a JSON array;
//!   never retried
//! - [`ApiError::NonRetryable`]: any other non-2xx; never retried
//!
//! The underlying client is built once and reused across all requests so a
//! batch does not open a TLS connection per report.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use auditflow_core::retry::RetryPolicy;
use auditflow_core::time::JitterSource;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper_rustls::HttpsConnector;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

/// Per-attempt timeout.
pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);

/// Response bodies larger than this are rejected rather than buffered.
const MAX_RESPONSE_BODY_BYTES: usize = 16 * 1024 * 1024;

/// How much of an error body is kept for diagnostics.
const ERROR_BODY_SNIPPET_BYTES: usize = 2_048;

type SharedHttpsClient = Client<HttpsConnector<HttpConnector>, Full<Bytes>>;

/// Classified remote-call failure.
#[derive(Debug, Error, Clone)]
#[non_exhaustive]
pub enum ApiError {
    /// The remote rejected our credentials; the run must abort.
    #[error("remote rejected authentication (status {status})")]
    FatalAuth {
        /// The 401 or 403 that was returned.
        status: u16,
    },

    /// A transient failure that exhausted the retry budget.
    #[error("remote call failed after {attempts} attempts: {reason}")]
    Retryable {
        /// Attempts made, including the first.
        attempts: u32,
        /// The last transient failure observed.
        reason: String,
    },

    /// A non-2xx status outside the transient classes.
    #[error("remote call rejected (status {status}): {body}")]
    NonRetryable {
        /// The returned status.
        status: u16,
        /// A snippet of the response body.
        body: String,
    },

    /// A 2xx response whose body was not the expected JSON array.
    #[error("remote response had unexpected shape: {reason}")]
    BadShape {
        /// What was wrong with the body.
        reason: String,
    },
}

impl ApiError {
    /// True for failures that abort the whole run regardless of stage.
    #[must_use]
    pub const fn is_fatal_auth(&self) -> bool {
        matches!(self, Self::FatalAuth { .. })
    }
}

/// Outcome of classifying a single attempt, before retry bookkeeping.
enum AttemptError {
    Fatal(ApiError),
    Transient(String),
}

/// JSON-over-POST client with the shared retry schedule.
pub struct HttpClient {
    client: OnceLock<SharedHttpsClient>,
    policy: RetryPolicy,
    jitter: Arc<dyn JitterSource>,
}

impl HttpClient {
    /// Creates a client with the given retry schedule and jitter source.
    #[must_use]
    pub fn new(policy: RetryPolicy, jitter: Arc<dyn JitterSource>) -> Self {
        Self {
            client: OnceLock::new(),
            policy,
            jitter,
        }
    }

    /// Lazily builds the shared hyper client.
    fn shared_client(&self) -> &SharedHttpsClient {
        self.client.get_or_init(|| {
            let https = hyper_rustls::HttpsConnectorBuilder::new()
                .with_webpki_roots()
                .https_or_http()
                .enable_http1()
                .enable_http2()
                .build();
            Client::builder(TokioExecutor::new()).build(https)
        })
    }

    /// POSTs `body` to `url` with a bearer token and returns the parsed
    /// top-level JSON array.
    ///
    /// Transient failures are retried on the shared schedule; all other
    /// classes return immediately.
    ///
    /// # Errors
    ///
    /// Returns a classified [`ApiError`]; see the module docs for the
    /// classes and their retry behaviour.
    pub async fn post_json_array(
        &self,
        url: &str,
        body: &Value,
        bearer: &SecretString,
    ) -> Result<Vec<Value>, ApiError> {
        let payload = serde_json::to_vec(body).map_err(|e| ApiError::BadShape {
            reason: format!("request body failed to serialise: {e}"),
        })?;

        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let delay = self.policy.delay_before_attempt(attempts, self.jitter.as_ref());
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            match self.attempt(url, payload.clone(), bearer).await {
                Ok(rows) => return Ok(rows),
                Err(AttemptError::Fatal(err)) => return Err(err),
                Err(AttemptError::Transient(reason)) => {
                    if self.policy.allows_another(attempts) {
                        warn!(url, attempt = attempts, %reason, "transient remote failure, will retry");
                        continue;
                    }
                    return Err(ApiError::Retryable { attempts, reason });
                },
            }
        }
    }

    /// One attempt: send, classify the status, bound and parse the body.
    async fn attempt(
        &self,
        url: &str,
        payload: Vec<u8>,
        bearer: &SecretString,
    ) -> Result<Vec<Value>, AttemptError> {
        let request = http::Request::builder()
            .method(http::Method::POST)
            .uri(url)
            .header(http::header::CONTENT_TYPE, "application/json")
            .header(http::header::ACCEPT, "application/json")
            .header(
                http::header::AUTHORIZATION,
                format!("Bearer {}", bearer.expose_secret()),
            )
            .body(Full::new(Bytes::from(payload)))
            .map_err(|e| {
                AttemptError::Fatal(ApiError::NonRetryable {
                    status: 0,
                    body: format!("failed to build request: {e}"),
                })
            })?;

        debug!(url, "posting to remote API");

        let response = match tokio::time::timeout(ATTEMPT_TIMEOUT, self.shared_client().request(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(AttemptError::Transient(format!("network error: {e}"))),
            Err(_) => {
                return Err(AttemptError::Transient(format!(
                    "attempt timed out after {ATTEMPT_TIMEOUT:?}"
                )));
            },
        };

        let (parts, body) = response.into_parts();
        let status = parts.status.as_u16();

        match classify_status(status) {
            StatusClass::Ok => {},
            StatusClass::FatalAuth => {
                return Err(AttemptError::Fatal(ApiError::FatalAuth { status }));
            },
            StatusClass::Transient => {
                return Err(AttemptError::Transient(format!("remote returned {status}")));
            },
            StatusClass::NonRetryable => {
                let snippet = read_body_snippet(body).await;
                return Err(AttemptError::Fatal(ApiError::NonRetryable {
                    status,
                    body: snippet,
                }));
            },
        }

        let bytes = Limited::new(body, MAX_RESPONSE_BODY_BYTES)
            .collect()
            .await
            .map(http_body_util::Collected::to_bytes)
            .map_err(|_| AttemptError::Transient("body read failed or exceeded size cap".to_string()))?;

        parse_json_array(&bytes).map_err(AttemptError::Fatal)
    }
}

impl std::fmt::Debug for HttpClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClient")
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// The four response classes the retry loop distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StatusClass {
    Ok,
    FatalAuth,
    Transient,
    NonRetryable,
}

const fn classify_status(status: u16) -> StatusClass {
    match status {
        200..=299 => StatusClass::Ok,
        401 | 403 => StatusClass::FatalAuth,
        429 | 500..=599 => StatusClass::Transient,
        _ => StatusClass::NonRetryable,
    }
}

/// Parses a 2xx body as a JSON array; anything else is [`ApiError::BadShape`].
fn parse_json_array(bytes: &[u8]) -> Result<Vec<Value>, ApiError> {
    let value: Value = serde_json::from_slice(bytes).map_err(|e| ApiError::BadShape {
        reason: format!("body is not JSON: {e}"),
    })?;
    match value {
        Value::Array(rows) => Ok(rows),
        other => Err(ApiError::BadShape {
            reason: format!("expected a JSON array, got {}", json_kind(&other)),
        }),
    }
}

const fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Reads a bounded snippet of an error body for diagnostics.
async fn read_body_snippet(body: hyper::body::Incoming) -> String {
    Limited::new(body, ERROR_BODY_SNIPPET_BYTES)
        .collect()
        .await
        .map_or_else(
            |_| "[body unavailable]".to_string(),
            |collected| {
                String::from_utf8(collected.to_bytes().to_vec())
                    .unwrap_or_else(|_| "[non-UTF8 body]".to_string())
            },
        )
}

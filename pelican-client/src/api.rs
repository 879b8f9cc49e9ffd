// SPDX-License-Identifier: MIT OR Apache-2.0

//! HTTP client for the Action API.
//!
//! The dispatcher talks to the server through the [`ActionApi`] trait so that
//! tests can inject a scripted implementation. [`HttpApi`] is the `reqwest`
//! implementation used on devices; every request carries a bounded timeout
//! distinct from the outer retry cadence, so one slow call cannot starve the
//! queue.
use std::time::Duration;

use reqwest::{Client, StatusCode, Url};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use pelican_core::{ErrorCode, IdempotencyKey};

/// Default per-request timeout.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(3);

/// Name of the idempotency key request header.
const IDEMPOTENCY_KEY_HEADER: &str = "Idempotency-Key";

/// Failure to deliver one action to the server.
///
/// Only [`ApiError::Transient`] is retryable; every other variant is terminal
/// for the idempotency key that produced it.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApiError {
    /// The payload itself is invalid; retrying the identical payload can
    /// never succeed.
    #[error("action rejected: {0}")]
    Validation(String),

    /// The idempotency key was already applied under a different identity.
    #[error("idempotency key conflict: {0}")]
    Conflict(String),

    /// The referenced session or entity does not exist, or its check-in
    /// window has passed.
    #[error("not found: {0}")]
    NotFound(String),

    /// Connectivity, timeout or server-side failure; the action stays queued.
    #[error("transient delivery failure: {0}")]
    Transient(String),
}

impl ApiError {
    /// Whether a later retry with the same idempotency key may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, ApiError::Transient(_))
    }
}

/// One async method per Action API endpoint.
///
/// Implementations return the decoded success body; server-side rejections
/// arrive as [`ApiError`] variants already classified for the dispatcher.
pub trait ActionApi {
    /// `POST /v1/broadcasts/{id}/ack`
    fn ack(
        &self,
        broadcast_id: &str,
        body: &Value,
        key: IdempotencyKey,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;

    /// `POST /v1/clock/records`
    fn clock_record(
        &self,
        body: &Value,
        key: IdempotencyKey,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;

    /// `POST /v1/attendance/check`
    fn attendance_check(
        &self,
        body: &Value,
        key: IdempotencyKey,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;

    /// `POST /v1/attendance/sessions`
    fn open_session(
        &self,
        body: &Value,
        key: Option<IdempotencyKey>,
    ) -> impl Future<Output = Result<Value, ApiError>> + Send;

    /// `POST /v1/attendance/sessions/{id}/close`
    fn close_session(&self, session_id: &str)
    -> impl Future<Output = Result<Value, ApiError>> + Send;
}

/// Wire shape of an Action API error body.
#[derive(Debug, Deserialize)]
struct WireError {
    code: ErrorCode,
    message: String,
}

/// `reqwest`-based [`ActionApi`] implementation.
#[derive(Clone, Debug)]
pub struct HttpApi {
    client: Client,
    base_url: Url,
}

impl HttpApi {
    /// Build a client for the Action API at `base_url` with the default
    /// request timeout.
    pub fn new(base_url: Url) -> Result<Self, reqwest::Error> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Build a client with a custom per-request timeout.
    pub fn with_timeout(base_url: Url, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, base_url })
    }

    async fn post(
        &self,
        path: &str,
        body: &Value,
        key: Option<IdempotencyKey>,
    ) -> Result<Value, ApiError> {
        let url = format!("{}/{path}", self.base_url.as_str().trim_end_matches('/'));

        let mut request = self.client.post(url).json(body);
        if let Some(key) = key {
            request = request.header(IDEMPOTENCY_KEY_HEADER, key.to_hex());
        }

        let response = request
            .send()
            .await
            .map_err(|err| ApiError::Transient(err.to_string()))?;
        let status = response.status();
        let body: Value = response
            .json()
            .await
            .map_err(|err| ApiError::Transient(format!("malformed response body: {err}")))?;

        if status.is_success() {
            return Ok(body);
        }

        Err(classify(status, body))
    }
}

/// Classify a non-success response into retryable vs. terminal.
///
/// The error code in the body is authoritative when present; the HTTP status
/// is the fallback for responses produced by proxies or panics rather than a
/// handler.
fn classify(status: StatusCode, body: Value) -> ApiError {
    if let Ok(wire) = serde_json::from_value::<WireError>(body) {
        return match wire.code {
            ErrorCode::Validation => ApiError::Validation(wire.message),
            ErrorCode::IdempotencyConflict => ApiError::Conflict(wire.message),
            ErrorCode::NotFound | ErrorCode::SessionExpired => ApiError::NotFound(wire.message),
            ErrorCode::Internal => ApiError::Transient(wire.message),
        };
    }

    match status {
        StatusCode::UNPROCESSABLE_ENTITY | StatusCode::BAD_REQUEST => {
            ApiError::Validation(format!("server replied {status}"))
        }
        StatusCode::CONFLICT => ApiError::Conflict(format!("server replied {status}")),
        StatusCode::NOT_FOUND => ApiError::NotFound(format!("server replied {status}")),
        status => ApiError::Transient(format!("server replied {status}")),
    }
}

impl ActionApi for HttpApi {
    async fn ack(
        &self,
        broadcast_id: &str,
        body: &Value,
        key: IdempotencyKey,
    ) -> Result<Value, ApiError> {
        self.post(&format!("v1/broadcasts/{broadcast_id}/ack"), body, Some(key))
            .await
    }

    async fn clock_record(&self, body: &Value, key: IdempotencyKey) -> Result<Value, ApiError> {
        self.post("v1/clock/records", body, Some(key)).await
    }

    async fn attendance_check(&self, body: &Value, key: IdempotencyKey) -> Result<Value, ApiError> {
        self.post("v1/attendance/check", body, Some(key)).await
    }

    async fn open_session(
        &self,
        body: &Value,
        key: Option<IdempotencyKey>,
    ) -> Result<Value, ApiError> {
        self.post("v1/attendance/sessions", body, key).await
    }

    async fn close_session(&self, session_id: &str) -> Result<Value, ApiError> {
        self.post(
            &format!("v1/attendance/sessions/{session_id}/close"),
            &Value::Object(Default::default()),
            None,
        )
        .await
    }
}

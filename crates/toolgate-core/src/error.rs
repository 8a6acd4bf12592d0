//! Structured error taxonomy and the error normalizer.
//!
//! Every failure that leaves the gateway, whether it was raised by a handler,
//! returned by a handler as an error-shaped value, or produced by the gateway
//! itself, is expressed as a [`StructuredError`]. The envelope shape and the
//! [`ErrorCategory::status_code`] mapping are identical on the synchronous
//! invoke path and on the asynchronous poll path.
//!
//! # Normalization
//!
//! - [`normalize_fault`] converts a raised [`anyhow::Error`] by walking its
//!   source chain for recognizable types.
//! - [`normalize_result`] inspects a successful handler value and extracts an
//!   error envelope when the value is error-shaped.
//!
//! Neither function panics or returns an error; unrecognized faults fall back
//! to [`ErrorCategory::Internal`].

use std::{fmt, io, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use tracing::error;
use uuid::Uuid;

use crate::context::Cancelled;

/// Status code reported for a successful invocation.
pub const SUCCESS_STATUS_CODE: u16 = 200;

/// Status code reported when an asynchronous invocation is accepted.
pub const ACCEPTED_STATUS_CODE: u16 = 202;

/// Sentinel status code for caller-initiated (or timeout) cancellation.
///
/// Deliberately outside the category mapping so callers can tell a
/// cancellation apart from any handler failure.
pub const CANCELLED_STATUS_CODE: u16 = 499;

/// Error code of an envelope produced by a cooperative cancellation.
pub const CANCELLED_ERROR_CODE: &str = "cancelled";

/// Key in [`StructuredError::details`] holding an upstream-mandated delay.
pub const RETRY_AFTER_DETAIL: &str = "retry_after_ms";

/// Closed set of failure categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Bad or missing arguments.
    Validation,
    /// Unknown tool or unknown remote entity.
    NotFound,
    /// Credential or permission failure.
    Auth,
    /// Backoff signaled by an upstream or by local policy.
    RateLimited,
    /// Remote dependency failure.
    Upstream,
    /// Unclassified failure.
    Internal,
}

impl ErrorCategory {
    /// Returns the transport status code for this category.
    ///
    /// This is a pure lookup; it is the only place the mapping lives.
    pub const fn status_code(self) -> u16 {
        match self {
            Self::Validation => 400,
            Self::Auth => 401,
            Self::NotFound => 404,
            Self::RateLimited => 429,
            Self::Upstream | Self::Internal => 500,
        }
    }

    /// Whether errors of this category are retryable when the producer did
    /// not say otherwise.
    pub const fn default_retryable(self) -> bool {
        matches!(self, Self::RateLimited | Self::Upstream)
    }

    /// Returns the snake-case wire name of this category.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::NotFound => "not_found",
            Self::Auth => "auth",
            Self::RateLimited => "rate_limited",
            Self::Upstream => "upstream",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when parsing an unknown category name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown error category: {0}")]
pub struct UnknownCategory(pub String);

impl FromStr for ErrorCategory {
    type Err = UnknownCategory;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "validation" | "invalid_argument" | "bad_request" => Ok(Self::Validation),
            "not_found" | "notfound" => Ok(Self::NotFound),
            "auth" | "unauthorized" | "forbidden" | "permission_denied" => Ok(Self::Auth),
            "rate_limited" | "rate_limit" | "throttled" => Ok(Self::RateLimited),
            "upstream" | "unavailable" => Ok(Self::Upstream),
            "internal" => Ok(Self::Internal),
            other => Err(UnknownCategory(other.to_string())),
        }
    }
}

/// The canonical failure envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{category} error ({code}): {message}")]
pub struct StructuredError {
    pub category: ErrorCategory,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub critical: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incident_id: Option<String>,
    #[serde(default)]
    pub details: Map<String, JsonValue>,
}

impl StructuredError {
    /// Creates an error with the category's default retryability.
    pub fn new(category: ErrorCategory, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category,
            code: code.into(),
            message: message.into(),
            retryable: category.default_retryable(),
            critical: false,
            hint: None,
            incident_id: None,
            details: Map::new(),
        }
    }

    pub fn validation(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Validation, code, message)
    }

    pub fn not_found(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::NotFound, code, message)
    }

    pub fn auth(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Auth, code, message)
    }

    pub fn rate_limited(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::RateLimited, code, message)
    }

    pub fn upstream(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Upstream, code, message)
    }

    /// Creates an internal error stamped with a fresh incident id.
    pub fn internal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, code, message).with_incident_id(new_incident_id())
    }

    #[must_use]
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    #[must_use]
    pub fn with_critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    #[must_use]
    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    #[must_use]
    pub fn with_incident_id(mut self, incident_id: impl Into<String>) -> Self {
        self.incident_id = Some(incident_id.into());
        self
    }

    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Records an upstream-mandated minimum wait before the next attempt.
    #[must_use]
    pub fn with_retry_after(self, delay: Duration) -> Self {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.with_detail(RETRY_AFTER_DETAIL, millis)
    }

    /// Returns the upstream-mandated minimum wait, if one was recorded.
    pub fn retry_after(&self) -> Option<Duration> {
        self.details
            .get(RETRY_AFTER_DETAIL)
            .and_then(JsonValue::as_u64)
            .map(Duration::from_millis)
    }

    /// Envelope for a handler that stopped at a cancellation checkpoint.
    ///
    /// Never retryable. Its status code is [`CANCELLED_STATUS_CODE`].
    pub fn cancelled(message: impl Into<String>) -> Self {
        Self::new(ErrorCategory::Internal, CANCELLED_ERROR_CODE, message).with_retryable(false)
    }

    /// Whether this envelope reports a cancellation rather than a failure.
    pub fn is_cancellation(&self) -> bool {
        self.code == CANCELLED_ERROR_CODE
    }

    /// Transport status code for this error.
    pub fn status_code(&self) -> u16 {
        if self.is_cancellation() {
            CANCELLED_STATUS_CODE
        } else {
            self.category.status_code()
        }
    }

    /// Serializes the envelope into a JSON object.
    ///
    /// Serialization of this type cannot fail, but the fallback keeps the
    /// normalizer path free of panics.
    pub fn to_json(&self) -> JsonValue {
        serde_json::to_value(self).unwrap_or_else(|_| {
            serde_json::json!({
                "category": self.category.as_str(),
                "code": self.code,
                "message": self.message,
                "retryable": self.retryable,
                "critical": self.critical,
            })
        })
    }
}

/// Generates an opaque incident id for correlating logs with envelopes.
pub fn new_incident_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Converts a raised handler fault into a structured error.
///
/// The source chain is walked outermost first; the first recognizable error
/// decides the category. Unrecognized faults become
/// [`ErrorCategory::Internal`] and are logged with their incident id.
pub fn normalize_fault(fault: &anyhow::Error) -> StructuredError {
    for cause in fault.chain() {
        if let Some(structured) = cause.downcast_ref::<StructuredError>() {
            return structured.clone();
        }
        if cause.downcast_ref::<Cancelled>().is_some() {
            return StructuredError::cancelled(format!("{fault:#}"));
        }
        if let Some(io_err) = cause.downcast_ref::<io::Error>() {
            return from_io_error(io_err);
        }
        if let Some(json_err) = cause.downcast_ref::<serde_json::Error>() {
            return StructuredError::validation("invalid_json", json_err.to_string());
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return StructuredError::upstream("timeout", format!("{fault:#}"));
        }
    }

    let structured = StructuredError::internal("internal_error", format!("{fault:#}"));
    error!(
        incident_id = structured.incident_id.as_deref().unwrap_or_default(),
        error = %format!("{fault:#}"),
        "Unclassified handler fault"
    );
    structured
}

fn from_io_error(err: &io::Error) -> StructuredError {
    let message = err.to_string();
    match err.kind() {
        io::ErrorKind::NotFound => StructuredError::not_found("io_not_found", message),
        io::ErrorKind::PermissionDenied => StructuredError::auth("permission_denied", message),
        io::ErrorKind::InvalidInput | io::ErrorKind::InvalidData => {
            StructuredError::validation("invalid_input", message)
        }
        io::ErrorKind::TimedOut => StructuredError::upstream("timeout", message),
        io::ErrorKind::ConnectionRefused
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::BrokenPipe
        | io::ErrorKind::Interrupted => StructuredError::upstream("connection_failed", message),
        _ => {
            let structured = StructuredError::internal("io_error", message);
            error!(
                incident_id = structured.incident_id.as_deref().unwrap_or_default(),
                error = %err,
                "Unclassified I/O fault"
            );
            structured
        }
    }
}

/// Extracts an error envelope from an error-shaped handler result.
///
/// Two shapes are recognized:
///
/// - `{"error": {"message": ..., "code": ..., "category": ...}}` (an `error`
///   object carrying at least `message` or `code`)
/// - `{"category": ..., "message": ...}` at the top level
///
/// Returns `None` for every other value.
pub fn normalize_result(value: &JsonValue) -> Option<StructuredError> {
    let object = value.as_object()?;

    if let Some(JsonValue::Object(inner)) = object.get("error")
        && (inner.contains_key("message") || inner.contains_key("code"))
    {
        return Some(envelope_from_map(inner));
    }

    if object.get("category").is_some_and(JsonValue::is_string)
        && object.get("message").is_some_and(JsonValue::is_string)
    {
        return Some(envelope_from_map(object));
    }

    None
}

fn envelope_from_map(map: &Map<String, JsonValue>) -> StructuredError {
    let category = map
        .get("category")
        .and_then(JsonValue::as_str)
        .and_then(|c| c.parse::<ErrorCategory>().ok())
        .unwrap_or(ErrorCategory::Internal);

    let code = map
        .get("code")
        .map(|c| match c {
            JsonValue::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| format!("{category}_error"));

    let message = map
        .get("message")
        .and_then(JsonValue::as_str)
        .unwrap_or("handler reported an error")
        .to_string();

    let mut structured = StructuredError::new(category, code, message);
    if let Some(retryable) = map.get("retryable").and_then(JsonValue::as_bool) {
        structured.retryable = retryable;
    }
    if let Some(critical) = map.get("critical").and_then(JsonValue::as_bool) {
        structured.critical = critical;
    }
    structured.hint = map.get("hint").and_then(JsonValue::as_str).map(String::from);
    structured.incident_id = map
        .get("incident_id")
        .and_then(JsonValue::as_str)
        .map(String::from);
    if let Some(JsonValue::Object(details)) = map.get("details") {
        structured.details.clone_from(details);
    }
    if category == ErrorCategory::Internal && structured.incident_id.is_none() {
        structured.incident_id = Some(new_incident_id());
    }
    structured
}

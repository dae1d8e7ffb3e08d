use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::AcquireError;

/// Errors surfaced by the capture orchestrator.
///
/// Every failure of a capture request ends up as exactly one of these kinds.
/// Lower layers report richer [`SessionError`]s which are folded into
/// [`CaptureError::CaptureFailed`] at the orchestrator boundary.
#[derive(Debug, Clone, Error)]
pub enum CaptureError {
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Duration },

    #[error("Navigation timed out after {0:?}")]
    NavigationTimeout(Duration),

    #[error("Failed to capture content: {0}")]
    CaptureFailed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidRequest,
    RateLimited,
    NavigationTimeout,
    CaptureFailed,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid_request",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::NavigationTimeout => "navigation_timeout",
            ErrorKind::CaptureFailed => "capture_failed",
        }
    }
}

impl CaptureError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            CaptureError::InvalidRequest(_) => ErrorKind::InvalidRequest,
            CaptureError::RateLimited { .. } => ErrorKind::RateLimited,
            CaptureError::NavigationTimeout(_) => ErrorKind::NavigationTimeout,
            CaptureError::CaptureFailed(_) => ErrorKind::CaptureFailed,
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            CaptureError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            CaptureError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            CaptureError::NavigationTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            CaptureError::CaptureFailed(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Message safe to hand back to the client.
    ///
    /// Browser and CDP details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            CaptureError::CaptureFailed(_) => "Failed to capture content".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<SessionError> for CaptureError {
    fn from(err: SessionError) -> Self {
        CaptureError::CaptureFailed(err.to_string())
    }
}

impl IntoResponse for CaptureError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.public_message(),
            "kind": self.kind().as_str(),
        });

        let mut response = (self.status_code(), Json(body)).into_response();

        if let CaptureError::RateLimited { retry_after } = &self {
            // Round up so clients never retry a second too early
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

/// Failures inside the browser session layer.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Browser launch failed: {0}")]
    LaunchFailed(String),

    #[error("Browser instance unavailable")]
    Unavailable,

    #[error("Page error: {0}")]
    Page(String),

    #[error("Navigation failed: {0}")]
    Navigation(String),

    #[error("Extraction failed: {0}")]
    Extraction(String),

    #[error("Page closed before the network became idle")]
    Closed,
}

impl From<chromiumoxide::error::CdpError> for SessionError {
    fn from(err: chromiumoxide::error::CdpError) -> Self {
        SessionError::Page(err.to_string())
    }
}

impl From<AcquireError> for SessionError {
    fn from(_: AcquireError) -> Self {
        SessionError::Unavailable
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        SessionError::LaunchFailed(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

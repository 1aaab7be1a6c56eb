//! Crate-wide error type.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};

/// Result type used throughout the limiter.
pub type LimiterResult<T> = Result<T, LimiterError>;

/// Errors surfaced by the limiter core.
#[derive(Debug, thiserror::Error)]
pub enum LimiterError {
    /// Constructor received an out-of-range parameter (e.g. a zero-size
    /// rolling window or a non-positive bucket interval). Fatal at
    /// construction time; indicates a caller bug.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// `Limiter::allow` decided to shed the request.
    #[error("Hertz Adaptlive limiting")]
    Rejected,
}

impl IntoResponse for LimiterError {
    fn into_response(self) -> Response {
        match self {
            LimiterError::Rejected => {
                (StatusCode::TOO_MANY_REQUESTS, "Hertz Adaptlive limiting").into_response()
            }
            LimiterError::InvalidArgument(msg) => {
                (StatusCode::INTERNAL_SERVER_ERROR, msg).into_response()
            }
        }
    }
}

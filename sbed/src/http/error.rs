//! Translation from core errors to the HTTP error envelope.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};

use sbe_common::error::{CoreError, ErrorCode, ErrorEnvelope, ErrorKind};

use crate::metrics;

/// A failed request. Wraps the core error and renders the wire envelope
/// `{error, message, details?, retryAfter?}` with a status class derived
/// from the error kind.
#[derive(Debug)]
pub struct ApiError(pub CoreError);

impl From<CoreError> for ApiError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

pub fn status_for(err: &CoreError) -> StatusCode {
    match err.kind() {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::NotFound => StatusCode::NOT_FOUND,
        ErrorKind::Conflict => StatusCode::CONFLICT,
        ErrorKind::Unauthorized => StatusCode::UNAUTHORIZED,
        ErrorKind::Forbidden => StatusCode::FORBIDDEN,
        ErrorKind::QuotaExceeded => StatusCode::TOO_MANY_REQUESTS,
        ErrorKind::Failure => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Fatal => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        metrics::HTTP_REQUESTS
            .with_label_values(&[if status.is_server_error() { "server_error" } else { "client_error" }])
            .inc();
        if self.0.code == ErrorCode::RateLimitExceeded {
            metrics::RATE_LIMITED.inc();
        }

        let envelope = ErrorEnvelope::from(&self.0);
        let mut response = (status, Json(envelope)).into_response();
        if let Some(secs) = self.0.retry_after_secs {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

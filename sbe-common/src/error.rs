//! Error taxonomy for the control plane.
//!
//! Every failure that crosses a service boundary carries a stable code from
//! the closed set below. The HTTP edge translates a [`CoreError`] into the
//! wire envelope `{error, message, details?, retryAfter?}`; periodic workers
//! log it with context and continue with the next item.
//!
//! # Code categories
//!
//! | Kind          | Codes                                                    |
//! |---------------|----------------------------------------------------------|
//! | Validation    | INVALID_TAG_QUERY, INVALID_TIMESTAMP, INVALID_VERSION,   |
//! |               | NO_PREVIOUS_VERSION, STALE_REPORT                        |
//! | NotFound      | DEVICE_NOT_FOUND, BUNDLE_NOT_FOUND, ROLLOUT_NOT_FOUND   |
//! | Conflict      | DEVICE_ALREADY_EXISTS, CONCURRENT_MODIFICATION,          |
//! |               | ACTIVE_ROLLOUT_EXISTS                                    |
//! | Unauthorized  | INVALID_API_KEY, INVALID_TOKEN                           |
//! | Forbidden     | DEVICE_NOT_APPROVED, TENANT_MISMATCH                     |
//! | QuotaExceeded | DEVICE_QUOTA_EXCEEDED, RATE_LIMIT_EXCEEDED               |
//! | Failure       | STORAGE_UNAVAILABLE, DOWNSTREAM_TIMEOUT                  |

use serde::{Deserialize, Serialize};
use std::fmt;

/// Broad error category, used to pick an HTTP status class and decide
/// whether the caller should retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    NotFound,
    Conflict,
    Unauthorized,
    Forbidden,
    QuotaExceeded,
    /// Retriable infrastructure failure.
    Failure,
    /// Non-retriable invariant break; logged, the one operation fails.
    Fatal,
}

/// The closed set of stable wire codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation
    InvalidTagQuery,
    InvalidTimestamp,
    InvalidVersion,
    InvalidMetadata,
    InvalidMetrics,
    InvalidRolloutSpec,
    NoPreviousVersion,
    StaleReport,
    // NotFound
    DeviceNotFound,
    GroupNotFound,
    BundleNotFound,
    RolloutNotFound,
    AlertNotFound,
    // Conflict
    DeviceAlreadyExists,
    ConcurrentModification,
    ActiveRolloutExists,
    // Unauthorized
    InvalidApiKey,
    InvalidToken,
    // Forbidden
    DeviceNotApproved,
    TenantMismatch,
    // Quota
    DeviceQuotaExceeded,
    RateLimitExceeded,
    // Retriable infrastructure
    StorageUnavailable,
    DownstreamTimeout,
    // Invariant break
    Internal,
}

impl ErrorCode {
    pub fn kind(self) -> ErrorKind {
        use ErrorCode::*;
        match self {
            InvalidTagQuery | InvalidTimestamp | InvalidVersion | InvalidMetadata
            | InvalidMetrics | InvalidRolloutSpec | NoPreviousVersion | StaleReport => {
                ErrorKind::Validation
            }
            DeviceNotFound | GroupNotFound | BundleNotFound | RolloutNotFound | AlertNotFound => {
                ErrorKind::NotFound
            }
            DeviceAlreadyExists | ConcurrentModification | ActiveRolloutExists => {
                ErrorKind::Conflict
            }
            InvalidApiKey | InvalidToken => ErrorKind::Unauthorized,
            DeviceNotApproved | TenantMismatch => ErrorKind::Forbidden,
            DeviceQuotaExceeded | RateLimitExceeded => ErrorKind::QuotaExceeded,
            StorageUnavailable | DownstreamTimeout => ErrorKind::Failure,
            Internal => ErrorKind::Fatal,
        }
    }

    /// The wire form, e.g. `DEVICE_NOT_FOUND`.
    pub fn as_str(self) -> &'static str {
        use ErrorCode::*;
        match self {
            InvalidTagQuery => "INVALID_TAG_QUERY",
            InvalidTimestamp => "INVALID_TIMESTAMP",
            InvalidVersion => "INVALID_VERSION",
            InvalidMetadata => "INVALID_METADATA",
            InvalidMetrics => "INVALID_METRICS",
            InvalidRolloutSpec => "INVALID_ROLLOUT_SPEC",
            NoPreviousVersion => "NO_PREVIOUS_VERSION",
            StaleReport => "STALE_REPORT",
            DeviceNotFound => "DEVICE_NOT_FOUND",
            GroupNotFound => "GROUP_NOT_FOUND",
            BundleNotFound => "BUNDLE_NOT_FOUND",
            RolloutNotFound => "ROLLOUT_NOT_FOUND",
            AlertNotFound => "ALERT_NOT_FOUND",
            DeviceAlreadyExists => "DEVICE_ALREADY_EXISTS",
            ConcurrentModification => "CONCURRENT_MODIFICATION",
            ActiveRolloutExists => "ACTIVE_ROLLOUT_EXISTS",
            InvalidApiKey => "INVALID_API_KEY",
            InvalidToken => "INVALID_TOKEN",
            DeviceNotApproved => "DEVICE_NOT_APPROVED",
            TenantMismatch => "TENANT_MISMATCH",
            DeviceQuotaExceeded => "DEVICE_QUOTA_EXCEEDED",
            RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            StorageUnavailable => "STORAGE_UNAVAILABLE",
            DownstreamTimeout => "DOWNSTREAM_TIMEOUT",
            Internal => "INTERNAL",
        }
    }

    /// Codes the agent may retry on.
    pub fn is_retriable(self) -> bool {
        matches!(
            self,
            Self::StorageUnavailable | Self::DownstreamTimeout | Self::RateLimitExceeded
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type carried across every service boundary.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CoreError {
    pub code: ErrorCode,
    pub message: String,
    /// Optional structured context for the wire envelope.
    pub details: Option<serde_json::Value>,
    /// Retry hint in seconds, set for rate-limit rejections.
    pub retry_after_secs: Option<u64>,
}

impl CoreError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), details: None, retry_after_secs: None }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn with_retry_after(mut self, secs: u64) -> Self {
        self.retry_after_secs = Some(secs);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.code.kind()
    }

    // Common constructors, so call sites stay one-liners.

    pub fn device_not_found(id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::DeviceNotFound, format!("device {id} not found"))
    }

    pub fn bundle_not_found(id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::BundleNotFound, format!("bundle {id} not found"))
    }

    pub fn rollout_not_found(id: impl fmt::Display) -> Self {
        Self::new(ErrorCode::RolloutNotFound, format!("rollout {id} not found"))
    }

    pub fn invalid_token() -> Self {
        Self::new(ErrorCode::InvalidToken, "registration token is invalid, used, or expired")
    }

    pub fn invalid_api_key() -> Self {
        Self::new(ErrorCode::InvalidApiKey, "API key is invalid, revoked, or expired")
    }

    pub fn storage(err: impl fmt::Display) -> Self {
        Self::new(ErrorCode::StorageUnavailable, format!("storage error: {err}"))
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }
}

/// The JSON failure envelope returned by every HTTP endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(rename = "retryAfter", skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

impl From<&CoreError> for ErrorEnvelope {
    fn from(err: &CoreError) -> Self {
        Self {
            error: err.code.as_str().to_string(),
            message: err.message.clone(),
            details: err.details.clone(),
            retry_after: err.retry_after_secs,
        }
    }
}

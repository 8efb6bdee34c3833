use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Structured error type for Spenso
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpensoError {
    /// Error code for programmatic handling
    pub code: ErrorCode,
    /// Human-readable error message
    pub message: String,
    /// Optional context for additional details
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    /// Severity level
    pub severity: ErrorSeverity,
    /// Error category, drives retry decisions
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<ErrorCategory>,
}

impl SpensoError {
    /// Create a new error builder with the specified error code
    pub fn new(code: ErrorCode) -> SpensoErrorBuilder {
        SpensoErrorBuilder {
            code,
            message: String::new(),
            context: None,
            severity: ErrorSeverity::Error,
            category: None,
        }
    }

    /// Returns true if the failure is a transient one (network blip, 5xx)
    pub fn is_transient(&self) -> bool {
        self.category.map_or(false, |c| c.is_transient())
    }

    /// Returns true if the failure came from the identity provider rejecting credentials
    pub fn is_authentication(&self) -> bool {
        self.category == Some(ErrorCategory::Authentication)
    }
}

/// Builder for creating SpensoError instances
pub struct SpensoErrorBuilder {
    code: ErrorCode,
    message: String,
    context: Option<String>,
    severity: ErrorSeverity,
    category: Option<ErrorCategory>,
}

impl SpensoErrorBuilder {
    /// Set the error message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    /// Set the error context
    pub fn context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Set the error severity
    pub fn severity(mut self, severity: ErrorSeverity) -> Self {
        self.severity = severity;
        self
    }

    /// Set the error category
    pub fn category(mut self, category: ErrorCategory) -> Self {
        self.category = Some(category);
        self
    }

    /// Build the final SpensoError
    pub fn build(self) -> SpensoError {
        SpensoError {
            code: self.code,
            message: self.message,
            context: self.context,
            severity: self.severity,
            category: self.category,
        }
    }
}

/// Error codes for different types of errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    // General errors
    Internal,

    // Authentication errors
    AuthSignInFailed,
    AuthNotSignedIn,
    AuthRefreshFailed,

    // Network errors
    NetworkTimeout,
    NetworkConnectionLost,

    // Remote API errors
    ApiRequestFailed,
    ApiResponseInvalid,
    ApiRateLimited,
    ServiceUnavailable,

    // Document store errors
    StoreWriteFailed,

    // Local storage errors
    StorageIo,
    SerializationFailed,

    // Input validation
    ValidationFailed,

    // Configuration related errors
    ConfigInvalid,
    ConfigMissing,
}

/// Spenso error types using thiserror
#[derive(Error, Debug, Clone)]
pub enum SpensoErrorType {
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Sign-in with {provider} failed: {reason}")]
    SignInFailed { provider: String, reason: String },

    #[error("No user is signed in")]
    NotSignedIn,

    #[error("Failed to refresh session token: {reason}")]
    AuthRefreshFailed { reason: String },

    #[error("Network timeout while talking to {service} during {operation}")]
    NetworkTimeout { service: String, operation: String },

    #[error("Network connection to {service} lost: {reason}")]
    NetworkConnectionLost { service: String, reason: String },

    #[error("{service} request failed with HTTP {status}: {reason}")]
    ApiRequestFailed {
        service: String,
        status: u16,
        reason: String,
    },

    #[error("{service} returned an unexpected response: {reason}")]
    ApiResponseInvalid { service: String, reason: String },

    #[error("{service} rate limit exceeded")]
    ApiRateLimited { service: String },

    #[error("{service} is unavailable (HTTP {status})")]
    ServiceUnavailable { service: String, status: u16 },

    #[error("Failed to write {collection}/{id}: {reason}")]
    StoreWriteFailed {
        collection: String,
        id: String,
        reason: String,
    },

    #[error("Local storage error at {path}: {reason}")]
    StorageIo { path: String, reason: String },

    #[error("Serialization failed: {reason}")]
    Serialization { reason: String },

    #[error("'{code}' is not a valid currency code")]
    InvalidCurrencyCode { code: String },

    #[error("Profile field '{field}' cannot be changed")]
    ReadOnlyField { field: String },

    #[error("Invalid configuration value for '{key}': {reason}")]
    ConfigInvalid {
        key: String,
        value: String,
        reason: String,
    },

    #[error("Required configuration key '{key}' is missing")]
    ConfigMissing { key: String },
}

/// Severity levels for errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorSeverity {
    /// Informational messages that don't impact functionality
    Info,
    /// Warnings that might impact functionality but don't stop operation
    Warning,
    /// Errors that impact functionality but allow continued operation
    Error,
    /// Critical errors that prevent the application from functioning properly
    Critical,
}

/// Error categories for different retry strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Temporary network issues, timeouts, etc.
    Network,
    /// Credentials rejected by the identity provider
    Authentication,
    /// API rate limiting
    RateLimit,
    /// Remote service answered with a 5xx
    ServiceUnavailable,
    /// Permission/access denied
    Permission,
    /// Configuration errors
    Configuration,
    /// Internal errors in our code
    Internal,
    /// Resource not found
    NotFound,
    /// Validation errors
    Validation,
}

impl ErrorCategory {
    /// Returns true for failures that say nothing about the validity of a session.
    ///
    /// A refresh that fails this way keeps the session alive and is retried later.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Network | Self::ServiceUnavailable)
    }
}

/// Fixed-delay retry policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub max_attempts: usize,
    /// Delay between attempts
    pub delay: Duration,
}

impl RetryPolicy {
    /// A policy that makes exactly one attempt
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            delay: Duration::ZERO,
        }
    }

    /// Create a policy with a fixed delay between attempts
    pub fn fixed_delay(max_attempts: usize, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay,
        }
    }

    /// Delay to wait after the given (1-based) failed attempt, if another attempt is allowed
    pub fn delay_after(&self, attempt: usize) -> Option<Duration> {
        if attempt >= self.max_attempts {
            None
        } else {
            Some(self.delay)
        }
    }
}

impl fmt::Display for SpensoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(context) = &self.context {
            write!(f, "{}: {} ({})", self.code, self.message, context)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCode::Internal => write!(f, "INTERNAL"),
            ErrorCode::AuthSignInFailed => write!(f, "AUTH_SIGN_IN_FAILED"),
            ErrorCode::AuthNotSignedIn => write!(f, "AUTH_NOT_SIGNED_IN"),
            ErrorCode::AuthRefreshFailed => write!(f, "AUTH_REFRESH_FAILED"),
            ErrorCode::NetworkTimeout => write!(f, "NETWORK_TIMEOUT"),
            ErrorCode::NetworkConnectionLost => write!(f, "NETWORK_CONNECTION_LOST"),
            ErrorCode::ApiRequestFailed => write!(f, "API_REQUEST_FAILED"),
            ErrorCode::ApiResponseInvalid => write!(f, "API_RESPONSE_INVALID"),
            ErrorCode::ApiRateLimited => write!(f, "API_RATE_LIMITED"),
            ErrorCode::ServiceUnavailable => write!(f, "SERVICE_UNAVAILABLE"),
            ErrorCode::StoreWriteFailed => write!(f, "STORE_WRITE_FAILED"),
            ErrorCode::StorageIo => write!(f, "STORAGE_IO"),
            ErrorCode::SerializationFailed => write!(f, "SERIALIZATION_FAILED"),
            ErrorCode::ValidationFailed => write!(f, "VALIDATION_FAILED"),
            ErrorCode::ConfigInvalid => write!(f, "CONFIG_INVALID"),
            ErrorCode::ConfigMissing => write!(f, "CONFIG_MISSING"),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorCategory::Network => write!(f, "Network"),
            ErrorCategory::Authentication => write!(f, "Authentication"),
            ErrorCategory::RateLimit => write!(f, "RateLimit"),
            ErrorCategory::ServiceUnavailable => write!(f, "ServiceUnavailable"),
            ErrorCategory::Permission => write!(f, "Permission"),
            ErrorCategory::Configuration => write!(f, "Configuration"),
            ErrorCategory::Internal => write!(f, "Internal"),
            ErrorCategory::NotFound => write!(f, "NotFound"),
            ErrorCategory::Validation => write!(f, "Validation"),
        }
    }
}

impl std::error::Error for SpensoError {}

impl From<SpensoErrorType> for SpensoError {
    fn from(err: SpensoErrorType) -> Self {
        let message = err.to_string();
        let (code, category, severity) = match &err {
            SpensoErrorType::Internal(_) => {
                (ErrorCode::Internal, ErrorCategory::Internal, ErrorSeverity::Error)
            }
            SpensoErrorType::SignInFailed { .. } => (
                ErrorCode::AuthSignInFailed,
                ErrorCategory::Authentication,
                ErrorSeverity::Error,
            ),
            SpensoErrorType::NotSignedIn => (
                ErrorCode::AuthNotSignedIn,
                ErrorCategory::Authentication,
                ErrorSeverity::Warning,
            ),
            SpensoErrorType::AuthRefreshFailed { .. } => (
                ErrorCode::AuthRefreshFailed,
                ErrorCategory::Authentication,
                ErrorSeverity::Error,
            ),
            SpensoErrorType::NetworkTimeout { .. } => (
                ErrorCode::NetworkTimeout,
                ErrorCategory::Network,
                ErrorSeverity::Warning,
            ),
            SpensoErrorType::NetworkConnectionLost { .. } => (
                ErrorCode::NetworkConnectionLost,
                ErrorCategory::Network,
                ErrorSeverity::Warning,
            ),
            SpensoErrorType::ApiRequestFailed { status, .. } => {
                let category = match *status {
                    401 => ErrorCategory::Authentication,
                    403 => ErrorCategory::Permission,
                    404 => ErrorCategory::NotFound,
                    400..=499 => ErrorCategory::Validation,
                    _ => ErrorCategory::Internal,
                };
                (ErrorCode::ApiRequestFailed, category, ErrorSeverity::Error)
            }
            SpensoErrorType::ApiResponseInvalid { .. } => (
                ErrorCode::ApiResponseInvalid,
                ErrorCategory::Internal,
                ErrorSeverity::Error,
            ),
            SpensoErrorType::ApiRateLimited { .. } => (
                ErrorCode::ApiRateLimited,
                ErrorCategory::RateLimit,
                ErrorSeverity::Warning,
            ),
            SpensoErrorType::ServiceUnavailable { .. } => (
                ErrorCode::ServiceUnavailable,
                ErrorCategory::ServiceUnavailable,
                ErrorSeverity::Warning,
            ),
            SpensoErrorType::StoreWriteFailed { .. } => (
                ErrorCode::StoreWriteFailed,
                ErrorCategory::Internal,
                ErrorSeverity::Error,
            ),
            SpensoErrorType::StorageIo { .. } => {
                (ErrorCode::StorageIo, ErrorCategory::Internal, ErrorSeverity::Error)
            }
            SpensoErrorType::Serialization { .. } => (
                ErrorCode::SerializationFailed,
                ErrorCategory::Internal,
                ErrorSeverity::Error,
            ),
            SpensoErrorType::InvalidCurrencyCode { .. } | SpensoErrorType::ReadOnlyField { .. } => (
                ErrorCode::ValidationFailed,
                ErrorCategory::Validation,
                ErrorSeverity::Warning,
            ),
            SpensoErrorType::ConfigInvalid { .. } => (
                ErrorCode::ConfigInvalid,
                ErrorCategory::Configuration,
                ErrorSeverity::Critical,
            ),
            SpensoErrorType::ConfigMissing { .. } => (
                ErrorCode::ConfigMissing,
                ErrorCategory::Configuration,
                ErrorSeverity::Critical,
            ),
        };

        SpensoError::new(code)
            .message(message)
            .category(category)
            .severity(severity)
            .build()
    }
}

impl From<reqwest::Error> for SpensoError {
    fn from(err: reqwest::Error) -> Self {
        let service = err
            .url()
            .and_then(|u| u.host_str())
            .unwrap_or("remote service")
            .to_string();

        let typed = if err.is_timeout() {
            errors::network_timeout(service, "request")
        } else if err.is_connect() || err.is_request() {
            errors::network_connection_lost(service, &err)
        } else if err.is_decode() {
            errors::api_response_invalid(service, &err)
        } else if let Some(status) = err.status() {
            errors::from_status(service, status.as_u16(), err.to_string())
        } else {
            SpensoErrorType::Internal(err.to_string())
        };

        typed.into()
    }
}

impl From<serde_json::Error> for SpensoError {
    fn from(err: serde_json::Error) -> Self {
        errors::serialization(err).into()
    }
}

/// Result type for Spenso operations
pub type SpensoResult<T> = Result<T, SpensoError>;

/// Helpers for building typed errors
pub mod errors {
    use super::*;

    pub fn sign_in_failed(provider: impl Into<String>, reason: impl fmt::Display) -> SpensoErrorType {
        SpensoErrorType::SignInFailed {
            provider: provider.into(),
            reason: reason.to_string(),
        }
    }

    pub fn not_signed_in() -> SpensoErrorType {
        SpensoErrorType::NotSignedIn
    }

    pub fn auth_refresh_failed(reason: impl fmt::Display) -> SpensoErrorType {
        SpensoErrorType::AuthRefreshFailed {
            reason: reason.to_string(),
        }
    }

    pub fn network_timeout(service: impl Into<String>, operation: impl Into<String>) -> SpensoErrorType {
        SpensoErrorType::NetworkTimeout {
            service: service.into(),
            operation: operation.into(),
        }
    }

    pub fn network_connection_lost(service: impl Into<String>, reason: impl fmt::Display) -> SpensoErrorType {
        SpensoErrorType::NetworkConnectionLost {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    pub fn api_response_invalid(service: impl Into<String>, reason: impl fmt::Display) -> SpensoErrorType {
        SpensoErrorType::ApiResponseInvalid {
            service: service.into(),
            reason: reason.to_string(),
        }
    }

    /// Map an HTTP error status to the matching error type
    pub fn from_status(service: impl Into<String>, status: u16, reason: impl Into<String>) -> SpensoErrorType {
        let service = service.into();
        match status {
            429 => SpensoErrorType::ApiRateLimited { service },
            500..=599 => SpensoErrorType::ServiceUnavailable { service, status },
            _ => SpensoErrorType::ApiRequestFailed {
                service,
                status,
                reason: reason.into(),
            },
        }
    }

    pub fn store_write_failed(collection: &str, id: &str, reason: impl fmt::Display) -> SpensoErrorType {
        SpensoErrorType::StoreWriteFailed {
            collection: collection.to_string(),
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn storage_io(path: impl fmt::Display, reason: impl fmt::Display) -> SpensoErrorType {
        SpensoErrorType::StorageIo {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn serialization(reason: impl fmt::Display) -> SpensoErrorType {
        SpensoErrorType::Serialization {
            reason: reason.to_string(),
        }
    }

    pub fn invalid_currency_code(code: impl Into<String>) -> SpensoErrorType {
        SpensoErrorType::InvalidCurrencyCode { code: code.into() }
    }

    pub fn read_only_field(field: impl Into<String>) -> SpensoErrorType {
        SpensoErrorType::ReadOnlyField { field: field.into() }
    }

    pub fn config_missing(key: impl Into<String>) -> SpensoErrorType {
        SpensoErrorType::ConfigMissing { key: key.into() }
    }

    pub fn config_invalid(
        key: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> SpensoErrorType {
        SpensoErrorType::ConfigInvalid {
            key: key.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        let err: SpensoError = errors::from_status("securetoken", 503, "down").into();
        assert_eq!(err.code, ErrorCode::ServiceUnavailable);
        assert!(err.is_transient());

        let err: SpensoError = errors::from_status("securetoken", 429, "slow down").into();
        assert_eq!(err.category, Some(ErrorCategory::RateLimit));
        assert!(!err.is_transient());

        let err: SpensoError = errors::from_status("securetoken", 401, "nope").into();
        assert!(err.is_authentication());
    }

    #[test]
    fn test_network_errors_are_transient() {
        let err: SpensoError = errors::network_timeout("firestore", "get").into();
        assert!(err.is_transient());

        let err: SpensoError = errors::auth_refresh_failed("TOKEN_EXPIRED").into();
        assert!(!err.is_transient());
        assert_eq!(err.code, ErrorCode::AuthRefreshFailed);
    }

    #[test]
    fn test_display_includes_context() {
        let err = SpensoError::new(ErrorCode::StoreWriteFailed)
            .message("write rejected")
            .context("users/abc")
            .build();
        assert_eq!(err.to_string(), "STORE_WRITE_FAILED: write rejected (users/abc)");
    }

    #[test]
    fn test_retry_policy_delays() {
        let policy = RetryPolicy::fixed_delay(2, Duration::from_millis(10));
        assert_eq!(policy.delay_after(1), Some(Duration::from_millis(10)));
        assert_eq!(policy.delay_after(2), None);

        // Zero attempts is clamped to one
        let policy = RetryPolicy::fixed_delay(0, Duration::from_millis(10));
        assert_eq!(policy.max_attempts, 1);
        assert_eq!(RetryPolicy::no_retry().delay_after(1), None);
    }
}

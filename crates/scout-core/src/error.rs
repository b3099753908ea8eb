use thiserror::Error;

/// Application-wide error types for Scout.
///
/// `ValidationFailure` and `NoRecordsFound` are deliberately absent: a recipe
/// whose selectors do not hold up is returned with capped confidence, and a
/// page without records yields an empty event list.
#[derive(Error, Debug)]
pub enum AppError {
    /// HTTP request failed (fetching a page).
    #[error("HTTP error: {0}")]
    HttpError(String),

    /// Request timed out.
    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    /// Network/connection error.
    #[error("Network error: {0}")]
    NetworkError(String),

    /// LLM API call failed.
    #[error("LLM error (HTTP {status_code}): {message}")]
    LlmError {
        message: String,
        status_code: u16,
        retryable: bool,
    },

    /// LLM provider rate limit exceeded.
    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    /// Malformed structured data or recipe JSON.
    #[error("Parse error: {0}")]
    ParseError(String),

    /// URL could not be parsed or has no host.
    #[error("Invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// A lifecycle outcome that is not allowed from the current status.
    #[error("Invalid transition from {from} on {outcome}")]
    InvalidTransition { from: String, outcome: String },

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Missing or invalid configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    pub fn invalid_url(url: &str, reason: impl Into<String>) -> Self {
        AppError::InvalidUrl {
            url: url.to_string(),
            reason: reason.into(),
        }
    }

    /// Returns true if this error is transient and worth retrying by the caller.
    pub fn is_retryable(&self) -> bool {
        match self {
            AppError::NetworkError(_) | AppError::Timeout(_) | AppError::RateLimitExceeded => true,
            AppError::LlmError { retryable, .. } => *retryable,
            AppError::HttpError(msg) => {
                msg.contains("timeout")
                    || msg.contains("connect")
                    || msg.contains("reset")
                    || msg.contains("HTTP 5")
            }
            _ => false,
        }
    }

    /// Returns true for network/HTTP failures fetching a page.
    pub fn is_fetch_error(&self) -> bool {
        matches!(
            self,
            AppError::HttpError(_) | AppError::NetworkError(_) | AppError::Timeout(_)
        )
    }

    /// Returns true for failures of the LLM provider or of its output.
    pub fn is_generation_error(&self) -> bool {
        matches!(
            self,
            AppError::LlmError { .. } | AppError::RateLimitExceeded | AppError::ParseError(_)
        )
    }
}

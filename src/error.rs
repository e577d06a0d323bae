use reqwest::StatusCode;
use std::time::Duration;
use thiserror::Error;

pub type ApiResult<T> = std::result::Result<T, ApiError>;

/// Failure classes shared by both directory integrations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    Authorization,
    NotFound,
    Conflict,
    RateLimit,
    TransientServer,
    Validation,
    Network,
    Timeout,
    Decode,
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Authorization denied: {0}")]
    Authorization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Rate limited: {message}")]
    RateLimited {
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("Server error ({status}): {message}")]
    TransientServer { status: u16, message: String },

    #[error("Validation error ({status}): {message}")]
    Validation { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Malformed response: {0}")]
    Decode(String),
}

impl ApiError {
    /// Classify a non-success HTTP status.
    pub fn from_status(
        status: StatusCode,
        url: &str,
        body: &str,
        retry_after: Option<Duration>,
    ) -> Self {
        let message = if body.is_empty() {
            url.to_string()
        } else {
            format!("{} ({})", url, truncate(body, 512))
        };

        match status.as_u16() {
            401 => ApiError::Authentication(message),
            403 => ApiError::Authorization(message),
            404 => ApiError::NotFound(message),
            409 => ApiError::Conflict(message),
            429 => ApiError::RateLimited {
                message,
                retry_after,
            },
            code @ 500..=599 => ApiError::TransientServer {
                status: code,
                message,
            },
            code => ApiError::Validation {
                status: code,
                message,
            },
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::Authentication(_) => ErrorKind::Authentication,
            ApiError::Authorization(_) => ErrorKind::Authorization,
            ApiError::NotFound(_) => ErrorKind::NotFound,
            ApiError::Conflict(_) => ErrorKind::Conflict,
            ApiError::RateLimited { .. } => ErrorKind::RateLimit,
            ApiError::TransientServer { .. } => ErrorKind::TransientServer,
            ApiError::Validation { .. } => ErrorKind::Validation,
            ApiError::Network(_) => ErrorKind::Network,
            ApiError::Timeout(_) => ErrorKind::Timeout,
            ApiError::Decode(_) => ErrorKind::Decode,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::RateLimit
                | ErrorKind::TransientServer
                | ErrorKind::Network
                | ErrorKind::Timeout
        )
    }

    /// Server-provided wait hint, only present on rate-limit responses.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ApiError::RateLimited { retry_after, .. } => *retry_after,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ApiError::Timeout(err.to_string())
        } else if err.is_decode() {
            ApiError::Decode(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::Decode(err.to_string())
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

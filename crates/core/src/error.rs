//! Error types for the termpilot domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum.

use thiserror::Error;

/// The top-level error type for termpilot operations.
#[derive(Debug, Error)]
pub enum Error {
    // --- Provider errors ---
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    // --- Tool errors ---
    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    // --- Lifecycle ---
    #[error("Agent loop has been terminated")]
    Terminated,

    // --- Generic ---
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

/// Failures raised by a provider adapter.
///
/// The variants carry enough structure for the turn loop to classify a
/// failure as transient, rate-limited, context-too-long or client-side.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("API request failed: {message} (status: {status_code})")]
    ApiError {
        status_code: u16,
        message: String,
        /// Backend error code, e.g. `rate_limit_exceeded`.
        code: Option<String>,
        /// Backend error type, e.g. `invalid_request_error`.
        error_type: Option<String>,
        /// Offending request parameter, e.g. `max_tokens`.
        param: Option<String>,
        request_id: Option<String>,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Stream closed prematurely: {0}")]
    StreamInterrupted(String),

    #[error("Provider not configured: {0}")]
    NotConfigured(String),

    #[error("Cannot reach {backend} at {endpoint}: {reason}")]
    Connection {
        backend: String,
        endpoint: String,
        reason: String,
    },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Invalid response from provider: {0}")]
    InvalidResponse(String),
}

impl ProviderError {
    /// Shorthand for an [`ProviderError::ApiError`] with only a status and message.
    pub fn api(status_code: u16, message: impl Into<String>) -> Self {
        Self::ApiError {
            status_code,
            message: message.into(),
            code: None,
            error_type: None,
            param: None,
            request_id: None,
        }
    }

    /// HTTP status attached to this error, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::ApiError { status_code, .. } => Some(*status_code),
            Self::AuthenticationFailed(_) => Some(401),
            Self::ModelNotFound(_) => Some(404),
            _ => None,
        }
    }

    /// The human-readable message without the variant prefix.
    pub fn message(&self) -> String {
        match self {
            Self::ApiError { message, .. } => message.clone(),
            Self::AuthenticationFailed(m)
            | Self::ModelNotFound(m)
            | Self::StreamInterrupted(m)
            | Self::NotConfigured(m)
            | Self::Timeout(m)
            | Self::Network(m)
            | Self::InvalidResponse(m) => m.clone(),
            Self::Connection { reason, .. } => reason.clone(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("invalid patch: {0}")]
    InvalidPatch(String),

    #[error("{0}")]
    PatchFailed(String),
}

//! Classification of provider failures and the messages shown for them.

use std::sync::LazyLock;
use std::time::Duration;

use regex_lite::Regex;
use termpilot_core::ProviderError;

/// How the turn loop reacts to a failure to open a response stream.
#[derive(Debug, Clone, PartialEq)]
pub enum FailureClass {
    /// Timeouts, connection failures and 5xx: retried immediately.
    Transient,
    /// Retried with exponential backoff, or after the delay the backend suggested.
    RateLimited { suggested: Option<Duration> },
    /// The request does not fit the model's context window.
    ContextTooLong,
    /// Any other 4xx: the request itself is wrong.
    Client,
    Unclassified,
}

impl FailureClass {
    pub fn of(err: &ProviderError) -> Self {
        if matches!(
            err,
            ProviderError::Timeout(_) | ProviderError::Connection { .. } | ProviderError::Network(_)
        ) || err.status_code().is_some_and(|s| s >= 500)
        {
            return Self::Transient;
        }

        let message = err.message();
        let error_type = error_type(err);
        let code = error_code(err);

        let too_many_tokens = param(err) == Some("max_tokens")
            || message.to_ascii_lowercase().contains("max_tokens is too large");
        if too_many_tokens && error_type == Some("invalid_request_error") {
            return Self::ContextTooLong;
        }

        if err.status_code() == Some(429)
            || code == Some("rate_limit_exceeded")
            || error_type == Some("rate_limit_exceeded")
            || message.to_ascii_lowercase().contains("rate limit")
        {
            return Self::RateLimited {
                suggested: suggested_retry_delay(&message),
            };
        }

        if err.status_code().is_some_and(|s| (400..500).contains(&s))
            || code == Some("invalid_request_error")
            || error_type == Some("invalid_request_error")
        {
            return Self::Client;
        }

        Self::Unclassified
    }
}

static RETRY_HINT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:retry|try) again in ([\d.]+)\s*s").expect("retry hint regex must compile")
});

static NETWORK_WORDS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)network|socket|stream").expect("network regex must compile")
});

/// `base × 2^(attempt − 1)`, for 1-based attempts.
pub fn rate_limit_backoff(base: Duration, attempt: u32) -> Duration {
    let exponent = attempt.saturating_sub(1).min(16);
    base.saturating_mul(1 << exponent)
}

/// Parses "Please try again in 1.3s" style hints.
pub fn suggested_retry_delay(message: &str) -> Option<Duration> {
    let captures = RETRY_HINT.captures(message)?;
    let seconds: f64 = captures.get(1)?.as_str().parse().ok()?;
    (seconds.is_finite() && seconds >= 0.0).then(|| Duration::from_secs_f64(seconds))
}

/// Failures that end a turn with the generic network message instead of
/// propagating to the caller.
pub fn is_network_or_server(err: &ProviderError) -> bool {
    if matches!(
        err,
        ProviderError::Timeout(_) | ProviderError::Connection { .. } | ProviderError::Network(_)
    ) || err.status_code().is_some_and(|s| s >= 500)
    {
        return true;
    }
    NETWORK_WORDS.is_match(&err.message())
}

fn error_code(err: &ProviderError) -> Option<&str> {
    match err {
        ProviderError::ApiError { code, .. } => code.as_deref(),
        _ => None,
    }
}

fn error_type(err: &ProviderError) -> Option<&str> {
    match err {
        ProviderError::ApiError { error_type, .. } => error_type.as_deref(),
        _ => None,
    }
}

fn param(err: &ProviderError) -> Option<&str> {
    match err {
        ProviderError::ApiError { param, .. } => param.as_deref(),
        _ => None,
    }
}

fn request_id(err: &ProviderError) -> Option<&str> {
    match err {
        ProviderError::ApiError { request_id, .. } => request_id.as_deref(),
        _ => None,
    }
}

fn error_details(err: &ProviderError) -> String {
    let message = err.message();
    format!(
        "Status: {}, Code: {}, Type: {}, Message: {}",
        err.status_code()
            .map(|s| s.to_string())
            .unwrap_or_else(|| "unknown".into()),
        error_code(err).unwrap_or("unknown"),
        error_type(err).unwrap_or("unknown"),
        if message.is_empty() { "unknown" } else { message.as_str() },
    )
}

pub mod messages {
    use super::*;

    pub const CONTEXT_TOO_LONG: &str = "⚠️  The current request exceeds the maximum context length supported by the chosen model. Please shorten the conversation, run /clear, or switch to a model with a larger context window and try again.";

    pub const PREMATURE_CLOSE: &str =
        "⚠️  Connection closed prematurely while waiting for the model. Please try again.";

    pub const NETWORK: &str = "⚠️  Network error while communicating with the LLM provider. Please check your connection and try again.";

    pub fn rate_limited(err: &ProviderError) -> String {
        format!(
            "⚠️  Rate limit reached. Error details: {}. Please try again later.",
            error_details(err)
        )
    }

    pub fn client_error(err: &ProviderError) -> String {
        let request = request_id(err)
            .map(|id| format!(" (request ID: {id})"))
            .unwrap_or_default();
        format!(
            "⚠️  The provider rejected the request{request}. Error details: {}. Please verify your settings and try again.",
            error_details(err)
        )
    }

    pub fn init_failed(provider: &str, err: &ProviderError) -> String {
        format!("⚠️ Failed to initialize the {provider} provider. Error: {err}")
    }

    pub fn unsupported_model(model: &str, provider: &str) -> String {
        format!(
            "⚠️  The model \"{model}\" does not appear in the list of models available for the {provider} provider.\nPlease check the model name and try again."
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api(status: u16, message: &str) -> ProviderError {
        ProviderError::api(status, message)
    }

    #[test]
    fn transient_failures() {
        assert_eq!(FailureClass::of(&ProviderError::Timeout("slow".into())), FailureClass::Transient);
        assert_eq!(FailureClass::of(&api(503, "unavailable")), FailureClass::Transient);
        assert_eq!(
            FailureClass::of(&ProviderError::Connection {
                backend: "ollama".into(),
                endpoint: "http://localhost:11434/api".into(),
                reason: "refused".into(),
            }),
            FailureClass::Transient
        );
    }

    #[test]
    fn context_too_long_needs_invalid_request_type() {
        let err = ProviderError::ApiError {
            status_code: 400,
            message: "max_tokens is too large: 99999".into(),
            code: None,
            error_type: Some("invalid_request_error".into()),
            param: Some("max_tokens".into()),
            request_id: None,
        };
        assert_eq!(FailureClass::of(&err), FailureClass::ContextTooLong);

        // Without the type it is an ordinary client error.
        assert_eq!(
            FailureClass::of(&api(400, "max_tokens is too large")),
            FailureClass::Client
        );
    }

    #[test]
    fn rate_limit_with_suggested_delay() {
        let err = api(429, "Rate limit reached. Please try again in 1.5s.");
        assert_eq!(
            FailureClass::of(&err),
            FailureClass::RateLimited {
                suggested: Some(Duration::from_millis(1500))
            }
        );

        let by_code = ProviderError::ApiError {
            status_code: 400,
            message: "slow down".into(),
            code: Some("rate_limit_exceeded".into()),
            error_type: None,
            param: None,
            request_id: None,
        };
        assert_eq!(
            FailureClass::of(&by_code),
            FailureClass::RateLimited { suggested: None }
        );
    }

    #[test]
    fn client_and_unclassified() {
        assert_eq!(
            FailureClass::of(&ProviderError::AuthenticationFailed("bad key".into())),
            FailureClass::Client
        );
        assert_eq!(FailureClass::of(&api(404, "nope")), FailureClass::Client);
        assert_eq!(
            FailureClass::of(&ProviderError::NotConfigured("missing".into())),
            FailureClass::Unclassified
        );
    }

    #[test]
    fn backoff_doubles() {
        let base = Duration::from_millis(2500);
        assert_eq!(rate_limit_backoff(base, 1), Duration::from_millis(2500));
        assert_eq!(rate_limit_backoff(base, 2), Duration::from_millis(5000));
        assert_eq!(rate_limit_backoff(base, 4), Duration::from_millis(20000));
    }

    #[test]
    fn suggested_delay_parsing() {
        assert_eq!(
            suggested_retry_delay("Please retry again in 2s"),
            Some(Duration::from_secs(2))
        );
        assert_eq!(suggested_retry_delay("no hint here"), None);
    }

    #[test]
    fn network_or_server_detection() {
        assert!(is_network_or_server(&ProviderError::Network("reset".into())));
        assert!(is_network_or_server(&api(502, "bad gateway")));
        assert!(is_network_or_server(&ProviderError::InvalidResponse(
            "socket hang up".into()
        )));
        assert!(!is_network_or_server(&ProviderError::NotConfigured("no key".into())));
    }

    #[test]
    fn client_message_includes_request_id() {
        let err = ProviderError::ApiError {
            status_code: 400,
            message: "bad input".into(),
            code: None,
            error_type: Some("invalid_request_error".into()),
            param: None,
            request_id: Some("req_123".into()),
        };
        let text = messages::client_error(&err);
        assert!(text.contains("(request ID: req_123)"));
        assert!(text.contains("Status: 400"));
        assert!(text.contains("Code: unknown"));
    }
}

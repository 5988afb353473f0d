//! HTTP plumbing shared by the adapters: client construction, sending with a
//! response-header timeout, and mapping failures into [`ProviderError`].

use std::time::Duration;

use serde::Deserialize;
use termpilot_core::ProviderError;
use tracing::warn;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Build a client without a whole-request timeout, so long streams are not
/// cut off. Time-to-headers is bounded by [`send`] instead.
pub(crate) fn build_client() -> Result<reqwest::Client, ProviderError> {
    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .map_err(|e| ProviderError::NotConfigured(format!("failed to build HTTP client: {e}")))
}

/// Send a request and turn non-2xx responses into errors.
pub(crate) async fn send(
    backend: &str,
    endpoint: &str,
    request: reqwest::RequestBuilder,
    timeout: Duration,
) -> Result<reqwest::Response, ProviderError> {
    let response = match tokio::time::timeout(timeout, request.send()).await {
        Err(_) => {
            return Err(ProviderError::Timeout(format!(
                "{backend} did not respond within {}s",
                timeout.as_secs()
            )));
        }
        Ok(Err(e)) => return Err(map_send_error(backend, endpoint, &e)),
        Ok(Ok(response)) => response,
    };

    if !response.status().is_success() {
        return Err(error_from_response(response).await);
    }
    Ok(response)
}

pub(crate) fn map_send_error(backend: &str, endpoint: &str, err: &reqwest::Error) -> ProviderError {
    if err.is_timeout() {
        ProviderError::Timeout(format!("{backend} request to {endpoint} timed out"))
    } else if err.is_connect() {
        ProviderError::Connection {
            backend: backend.to_string(),
            endpoint: endpoint.to_string(),
            reason: err.to_string(),
        }
    } else {
        ProviderError::Network(err.to_string())
    }
}

pub(crate) async fn error_from_response(response: reqwest::Response) -> ProviderError {
    let status = response.status().as_u16();
    let request_id = response
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let body = response.text().await.unwrap_or_default();
    warn!(status, body = %body, "Provider returned error");
    parse_error_body(status, &body, request_id)
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ErrorDetail {
    Structured {
        #[serde(default)]
        message: Option<String>,
        #[serde(default, rename = "type")]
        error_type: Option<String>,
        #[serde(default)]
        code: Option<serde_json::Value>,
        #[serde(default)]
        param: Option<String>,
    },
    Plain(String),
}

/// Map an error body into a [`ProviderError`].
///
/// Understands OpenAI-style `{"error": {"message", "type", "code", "param"}}`
/// and the `{"error": "..."}` shape used by Ollama and TGI.
pub(crate) fn parse_error_body(status: u16, body: &str, request_id: Option<String>) -> ProviderError {
    let (message, error_type, code, param) = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope {
            error:
                ErrorDetail::Structured {
                    message,
                    error_type,
                    code,
                    param,
                },
        }) => {
            let code = code.map(|c| match c {
                serde_json::Value::String(s) => s,
                other => other.to_string(),
            });
            (message, error_type, code, param)
        }
        Ok(ErrorEnvelope {
            error: ErrorDetail::Plain(message),
        }) => (Some(message), None, None, None),
        Err(_) => (None, None, None, None),
    };

    let message = message
        .filter(|m| !m.trim().is_empty())
        .or_else(|| {
            let trimmed = body.trim();
            (!trimmed.is_empty()).then(|| trimmed.to_string())
        })
        .unwrap_or_else(|| format!("HTTP {status}"));

    match status {
        401 | 403 => ProviderError::AuthenticationFailed(message),
        404 if message.to_ascii_lowercase().contains("model") => {
            ProviderError::ModelNotFound(message)
        }
        _ => ProviderError::ApiError {
            status_code: status,
            message,
            code,
            error_type,
            param,
            request_id,
        },
    }
}

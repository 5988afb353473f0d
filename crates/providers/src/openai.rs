//! OpenAI Responses API provider.
//!
//! The Responses API already streams in the normalized vocabulary, so this
//! adapter is mostly a passthrough: it maps `response.output_item.added`,
//! `response.output_text.delta`, `response.output_item.done` and
//! `response.completed` onto [`StreamingEvent`]s and turns `error` /
//! `response.failed` events into [`ProviderError`]s.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use termpilot_core::provider::*;
use termpilot_core::{ContentPart, ConversationItem, ProviderError, Role};
use tracing::{debug, trace, warn};

use crate::http;
use crate::stream::{LineDecoder, spawn_pump};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const MODEL_LIST_TIMEOUT: Duration = Duration::from_secs(10);

struct Connection {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

/// An OpenAI Responses API provider.
#[derive(Default)]
pub struct OpenAiProvider {
    connection: Option<Connection>,
}

impl OpenAiProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn connection(&self) -> Result<&Connection, ProviderError> {
        self.connection
            .as_ref()
            .ok_or_else(|| ProviderError::NotConfigured("OpenAI provider is not initialized".into()))
    }

    fn request_body(request: &ResponseRequest) -> Value {
        let mut body = json!({
            "model": request.model,
            "instructions": request.instructions,
            "input": to_api_input(&request.input),
            "stream": true,
            "parallel_tool_calls": false,
        });
        if let Some(previous) = &request.previous_response_id {
            body["previous_response_id"] = json!(previous);
        }
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "name": tool.name,
                            "description": tool.description,
                            "parameters": tool.parameters,
                            "strict": false,
                        })
                    })
                    .collect(),
            );
        }
        body
    }
}

#[async_trait]
impl Provider for OpenAiProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::OpenAi
    }

    async fn initialize(&mut self, options: ProviderOptions) -> Result<(), ProviderError> {
        let api_key = options.api_key.filter(|k| !k.trim().is_empty()).ok_or_else(|| {
            ProviderError::NotConfigured(
                "OpenAI requires an API key. Set OPENAI_API_KEY or api_key in config.toml".into(),
            )
        })?;
        let base_url = options
            .base_url
            .unwrap_or_else(|| ProviderKind::OpenAi.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();

        debug!(base_url = %base_url, "Initializing OpenAI provider");
        self.connection = Some(Connection {
            client: http::build_client()?,
            base_url,
            api_key,
            timeout: options.timeout.unwrap_or(DEFAULT_TIMEOUT),
        });
        Ok(())
    }

    async fn create_streaming_response(
        &self,
        request: ResponseRequest,
    ) -> Result<ResponseStream, ProviderError> {
        let conn = self.connection()?;
        let url = format!("{}/responses", conn.base_url);
        let body = Self::request_body(&request);

        debug!(
            model = %request.model,
            items = request.input.len(),
            previous_response_id = ?request.previous_response_id,
            "Sending streaming request"
        );

        let builder = conn
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", conn.api_key))
            .header("Accept", "text/event-stream")
            .json(&body);
        let response = http::send("openai", &url, builder, conn.timeout).await?;

        if let Some(request_id) = response
            .headers()
            .get("x-request-id")
            .and_then(|v| v.to_str().ok())
        {
            debug!(request_id, "OpenAI stream opened");
        }

        let (sender, stream) = ResponseStream::channel(64);
        spawn_pump(
            "openai",
            Box::pin(response.bytes_stream()),
            ResponsesDecoder::default(),
            sender,
        );
        Ok(stream)
    }

    async fn list_available_models(&self) -> Vec<String> {
        let Ok(conn) = self.connection() else {
            return Vec::new();
        };
        let url = format!("{}/models", conn.base_url);
        let builder = conn
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", conn.api_key));

        let response = match http::send("openai", &url, builder, MODEL_LIST_TIMEOUT).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Failed to list OpenAI models");
                return Vec::new();
            }
        };

        #[derive(Deserialize)]
        struct ModelList {
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        struct ModelEntry {
            id: String,
        }

        match response.json::<ModelList>().await {
            Ok(list) => list.data.into_iter().map(|m| m.id).collect(),
            Err(e) => {
                warn!(error = %e, "Unparseable OpenAI model list");
                Vec::new()
            }
        }
    }
}

/// Convert conversation items into Responses API input items.
fn to_api_input(items: &[ConversationItem]) -> Vec<Value> {
    items
        .iter()
        .filter_map(|item| match item {
            ConversationItem::Message { role, content, .. } => {
                let text_type = match role {
                    Role::Assistant => "output_text",
                    Role::User | Role::System => "input_text",
                };
                let parts: Vec<Value> = content
                    .iter()
                    .map(|part| match part {
                        ContentPart::Text { text } => json!({ "type": text_type, "text": text }),
                        ContentPart::Image { image_url } => {
                            json!({ "type": "input_image", "image_url": image_url })
                        }
                    })
                    .collect();
                Some(json!({ "type": "message", "role": role, "content": parts }))
            }
            ConversationItem::FunctionCall {
                call_id,
                name,
                arguments,
                ..
            } => Some(json!({
                "type": "function_call",
                "call_id": call_id,
                "name": name,
                "arguments": arguments,
            })),
            ConversationItem::FunctionCallOutput { call_id, .. } => Some(json!({
                "type": "function_call_output",
                "call_id": call_id,
                "output": item.output_payload().unwrap_or_default(),
            })),
            // Reasoning items cannot be replayed without their encrypted content.
            ConversationItem::Reasoning { .. } => None,
        })
        .collect()
}

// --- Responses API streaming types (internal) ---

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ApiEvent {
    #[serde(rename = "response.output_item.added")]
    OutputItemAdded { item: ApiItem },
    #[serde(rename = "response.output_text.delta")]
    OutputTextDelta { item_id: String, delta: String },
    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: ApiItem },
    #[serde(rename = "response.completed")]
    Completed { response: ApiResponse },
    #[serde(rename = "response.incomplete")]
    Incomplete { response: ApiResponse },
    #[serde(rename = "response.failed")]
    Failed { response: ApiResponse },
    #[serde(rename = "error")]
    Error {
        #[serde(default)]
        code: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        param: Option<String>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    id: String,
    #[serde(default)]
    output: Vec<ApiItem>,
    #[serde(default)]
    error: Option<ApiErrorBody>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiItem {
    Message {
        id: String,
        role: String,
        #[serde(default)]
        content: Vec<ApiContent>,
    },
    FunctionCall {
        #[serde(default)]
        id: Option<String>,
        call_id: String,
        name: String,
        #[serde(default)]
        arguments: String,
    },
    Reasoning {
        id: String,
        #[serde(default)]
        summary: Vec<ApiSummary>,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ApiContent {
    OutputText { text: String },
    InputText { text: String },
    Refusal { refusal: String },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct ApiSummary {
    #[serde(default)]
    text: String,
}

impl ApiItem {
    fn into_item(self) -> Option<ConversationItem> {
        match self {
            ApiItem::Message { id, role, content } => {
                let role = match role.as_str() {
                    "user" => Role::User,
                    "system" | "developer" => Role::System,
                    _ => Role::Assistant,
                };
                let content = content
                    .into_iter()
                    .filter_map(|part| match part {
                        ApiContent::OutputText { text } | ApiContent::InputText { text } => {
                            Some(ContentPart::Text { text })
                        }
                        ApiContent::Refusal { refusal } => Some(ContentPart::Text { text: refusal }),
                        ApiContent::Other => None,
                    })
                    .collect();
                Some(ConversationItem::Message { id, role, content })
            }
            ApiItem::FunctionCall {
                id,
                call_id,
                name,
                arguments,
            } => Some(ConversationItem::FunctionCall {
                id: id.unwrap_or_else(|| call_id.clone()),
                call_id,
                name,
                arguments,
            }),
            ApiItem::Reasoning { id, summary } => Some(ConversationItem::Reasoning {
                id,
                summary: summary.into_iter().map(|s| s.text).collect(),
                duration_ms: None,
            }),
            ApiItem::Unknown => None,
        }
    }
}

fn stream_error(code: Option<String>, message: Option<String>, param: Option<String>) -> ProviderError {
    ProviderError::ApiError {
        status_code: 500,
        message: message.unwrap_or_else(|| "response failed".into()),
        code,
        error_type: None,
        param,
        request_id: None,
    }
}

/// Decodes Responses API server-sent events.
#[derive(Debug, Default)]
pub(crate) struct ResponsesDecoder {
    done_items: Vec<ConversationItem>,
    complete: bool,
}

impl ResponsesDecoder {
    fn completed(&mut self, response: ApiResponse, status: ResponseStatus) -> StreamingEvent {
        self.complete = true;
        let mut output: Vec<ConversationItem> =
            response.output.into_iter().filter_map(ApiItem::into_item).collect();
        if output.is_empty() {
            output = std::mem::take(&mut self.done_items);
        }
        StreamingEvent::Completed {
            response: CompletedResponse {
                id: response.id,
                output,
                status,
            },
        }
    }
}

impl LineDecoder for ResponsesDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamingEvent>, ProviderError> {
        // `event:` lines repeat the type carried inside the data payload.
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(Vec::new());
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            return Ok(Vec::new());
        }

        let event = match serde_json::from_str::<ApiEvent>(data) {
            Ok(event) => event,
            Err(e) => {
                trace!(data = %data, error = %e, "Ignoring unparseable SSE chunk");
                return Ok(Vec::new());
            }
        };

        let events = match event {
            ApiEvent::OutputItemAdded { item } => item
                .into_item()
                .map(|item| StreamingEvent::OutputItemStart { item })
                .into_iter()
                .collect(),
            ApiEvent::OutputTextDelta { item_id, delta } => {
                vec![StreamingEvent::OutputItemDelta { item_id, delta }]
            }
            ApiEvent::OutputItemDone { item } => match item.into_item() {
                Some(item) => {
                    self.done_items.push(item.clone());
                    vec![StreamingEvent::OutputItemDone { item }]
                }
                None => Vec::new(),
            },
            ApiEvent::Completed { response } => {
                vec![self.completed(response, ResponseStatus::Completed)]
            }
            ApiEvent::Incomplete { response } => {
                vec![self.completed(response, ResponseStatus::Incomplete)]
            }
            ApiEvent::Failed { response } => {
                let error = response.error.unwrap_or(ApiErrorBody {
                    code: None,
                    message: None,
                });
                return Err(stream_error(error.code, error.message, None));
            }
            ApiEvent::Error {
                code,
                message,
                param,
            } => return Err(stream_error(code, message, param)),
            ApiEvent::Other => Vec::new(),
        };
        Ok(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamingEvent>, ProviderError> {
        if self.complete {
            return Ok(Vec::new());
        }
        Err(ProviderError::StreamInterrupted(
            "OpenAI stream closed before response.completed".into(),
        ))
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::test_support::{assert_round_trip, collect};

    fn decode(lines: &[&str]) -> Vec<StreamingEvent> {
        let mut decoder = ResponsesDecoder::default();
        lines
            .iter()
            .flat_map(|line| decoder.decode_line(line).unwrap())
            .collect()
    }

    #[test]
    fn parse_text_delta() {
        let events = decode(&[
            r#"data: {"type":"response.output_text.delta","item_id":"msg_1","output_index":0,"delta":"Hel"}"#,
        ]);
        assert_eq!(
            events,
            vec![StreamingEvent::OutputItemDelta {
                item_id: "msg_1".into(),
                delta: "Hel".into()
            }]
        );
    }

    #[test]
    fn event_lines_and_done_marker_are_ignored() {
        assert!(decode(&["event: response.created", "", "data: [DONE]", ": ping"]).is_empty());
    }

    #[test]
    fn parse_function_call_done() {
        let events = decode(&[
            r#"data: {"type":"response.output_item.done","item":{"type":"function_call","id":"fc_1","call_id":"call_1","name":"shell","arguments":"{\"cmd\":[\"ls\"]}","status":"completed"}}"#,
        ]);
        match &events[0] {
            StreamingEvent::OutputItemDone {
                item: ConversationItem::FunctionCall { call_id, name, arguments, .. },
            } => {
                assert_eq!(call_id, "call_1");
                assert_eq!(name, "shell");
                assert!(arguments.contains("ls"));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[test]
    fn unknown_item_types_are_skipped() {
        let events = decode(&[
            r#"data: {"type":"response.output_item.done","item":{"type":"web_search_call","id":"ws_1"}}"#,
        ]);
        assert!(events.is_empty());
    }

    #[test]
    fn error_event_becomes_provider_error() {
        let mut decoder = ResponsesDecoder::default();
        let err = decoder
            .decode_line(r#"data: {"type":"error","code":"server_error","message":"boom"}"#)
            .unwrap_err();
        assert!(matches!(err, ProviderError::ApiError { ref code, .. } if code.as_deref() == Some("server_error")));
    }

    #[test]
    fn missing_completed_is_premature_close() {
        let mut decoder = ResponsesDecoder::default();
        assert!(matches!(
            decoder.finish(),
            Err(ProviderError::StreamInterrupted(_))
        ));
    }

    #[tokio::test]
    async fn full_stream_round_trips() {
        let events = collect(
            ResponsesDecoder::default(),
            vec![
                "event: response.output_item.added\n",
                "data: {\"type\":\"response.output_item.added\",\"item\":{\"type\":\"message\",\"id\":\"msg_1\",\"role\":\"assistant\",\"content\":[]}}\n\n",
                "data: {\"type\":\"response.output_text.delta\",\"item_id\":\"msg_1\",\"delta\":\"H\"}\n\n",
                "data: {\"type\":\"response.output_text.delta\",\"item_id\":\"msg_1\",\"delta\":\"i\"}\n\n",
                "data: {\"type\":\"response.output_item.done\",\"item\":{\"type\":\"message\",\"id\":\"msg_1\",\"role\":\"assistant\",\"content\":[{\"type\":\"output_text\",\"text\":\"Hi\",\"annotations\":[]}]}}\n\n",
                "data: {\"type\":\"response.completed\",\"response\":{\"id\":\"resp_1\",\"status\":\"completed\",\"output\":[{\"type\":\"message\",\"id\":\"msg_1\",\"role\":\"assistant\",\"content\":[{\"type\":\"output_text\",\"text\":\"Hi\"}]}]}}\n\n",
            ],
        )
        .await;

        let events: Vec<StreamingEvent> = events.into_iter().map(|e| e.unwrap()).collect();
        assert!(matches!(events[0], StreamingEvent::OutputItemStart { .. }));
        assert_round_trip(&events);
        match events.last() {
            Some(StreamingEvent::Completed { response }) => {
                assert_eq!(response.id, "resp_1");
                assert_eq!(response.output[0].text().unwrap(), "Hi");
            }
            other => panic!("unexpected last event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn truncated_stream_ends_with_interruption() {
        let events = collect(
            ResponsesDecoder::default(),
            vec!["data: {\"type\":\"response.output_text.delta\",\"item_id\":\"m\",\"delta\":\"x\"}\n"],
        )
        .await;
        assert!(matches!(
            events.last(),
            Some(Err(ProviderError::StreamInterrupted(_)))
        ));
    }

    #[test]
    fn request_body_includes_tools_and_previous_id() {
        let request = ResponseRequest {
            model: "o4-mini".into(),
            instructions: "be brief".into(),
            input: vec![
                ConversationItem::user_text("Hello"),
                ConversationItem::aborted_output("call_1"),
            ],
            previous_response_id: Some("resp_0".into()),
            tools: vec![ToolDefinition {
                name: "shell".into(),
                description: "Runs a shell command".into(),
                parameters: json!({"type": "object"}),
            }],
        };
        let body = OpenAiProvider::request_body(&request);
        assert_eq!(body["previous_response_id"], "resp_0");
        assert_eq!(body["stream"], true);
        assert_eq!(body["tools"][0]["type"], "function");
        assert_eq!(body["input"][0]["content"][0]["type"], "input_text");
        assert_eq!(body["input"][1]["type"], "function_call_output");
        let output: Value = serde_json::from_str(body["input"][1]["output"].as_str().unwrap()).unwrap();
        assert_eq!(output["output"], "aborted");
    }

    #[tokio::test]
    async fn initialize_requires_api_key() {
        let mut provider = OpenAiProvider::new();
        let err = provider.initialize(ProviderOptions::default()).await.unwrap_err();
        assert!(matches!(err, ProviderError::NotConfigured(_)));
        assert!(provider.list_available_models().await.is_empty());
    }
}

//! Ollama provider (local inference server).
//!
//! Talks to `/api/chat`, which streams one JSON object per line. Generation
//! parameters come from the layered Ollama configuration. Ollama keeps no
//! conversation state, so history is replayed from a [`TranscriptCache`].

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Map, Value, json};
use termpilot_config::{ModelParams, OllamaConfig};
use termpilot_core::item::new_item_id;
use termpilot_core::provider::*;
use termpilot_core::{ContentPart, ConversationItem, ProviderError, Role};
use tracing::{debug, warn};

use crate::http;
use crate::stream::{LineDecoder, TextAccumulator, spawn_pump};
use crate::transcript::TranscriptCache;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

struct Connection {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

pub struct OllamaProvider {
    config: OllamaConfig,
    transcripts: Arc<TranscriptCache>,
    connection: Option<Connection>,
}

impl OllamaProvider {
    pub fn new(config: OllamaConfig) -> Self {
        Self {
            config,
            transcripts: Arc::new(TranscriptCache::default()),
            connection: None,
        }
    }

    fn connection(&self) -> Result<&Connection, ProviderError> {
        self.connection
            .as_ref()
            .ok_or_else(|| ProviderError::NotConfigured("Ollama provider is not initialized".into()))
    }

    async fn fetch_tags(&self, conn: &Connection, timeout: Duration) -> Result<Vec<String>, ProviderError> {
        let url = format!("{}/tags", conn.base_url);
        let response = http::send("ollama", &url, conn.client.get(&url), timeout).await?;

        #[derive(Deserialize)]
        struct Tags {
            #[serde(default)]
            models: Vec<Tag>,
        }
        #[derive(Deserialize)]
        struct Tag {
            name: String,
        }

        let tags: Tags = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(format!("unparseable /tags response: {e}")))?;
        Ok(tags.models.into_iter().map(|t| t.name).collect())
    }
}

#[async_trait]
impl Provider for OllamaProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Ollama
    }

    async fn initialize(&mut self, options: ProviderOptions) -> Result<(), ProviderError> {
        let base_url = options
            .base_url
            .unwrap_or_else(|| ProviderKind::Ollama.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();
        let conn = Connection {
            client: http::build_client()?,
            base_url: base_url.clone(),
            timeout: options.timeout.unwrap_or(DEFAULT_TIMEOUT),
        };

        // The server must be up before the first turn.
        if let Err(e) = self.fetch_tags(&conn, PROBE_TIMEOUT).await {
            warn!(endpoint = %base_url, error = %e, "Ollama server is not reachable");
            return Err(ProviderError::Connection {
                backend: "ollama".into(),
                endpoint: base_url,
                reason: e.to_string(),
            });
        }

        debug!(base_url = %conn.base_url, "Ollama provider initialized");
        self.connection = Some(conn);
        Ok(())
    }

    async fn create_streaming_response(
        &self,
        request: ResponseRequest,
    ) -> Result<ResponseStream, ProviderError> {
        let conn = self.connection()?;
        let params = self.config.params_for(&request.model);
        let transcript = self
            .transcripts
            .resolve(request.previous_response_id.as_deref(), &request.input);

        let mut body = json!({
            "model": request.model,
            "messages": to_ollama_messages(&request.instructions, &transcript),
            "stream": params.streaming(),
            "options": ollama_options(&params),
        });
        if !request.tools.is_empty() {
            body["tools"] = Value::Array(
                request
                    .tools
                    .iter()
                    .map(|tool| {
                        json!({
                            "type": "function",
                            "function": {
                                "name": tool.name,
                                "description": tool.description,
                                "parameters": tool.parameters,
                            }
                        })
                    })
                    .collect(),
            );
        }

        let url = format!("{}/chat", conn.base_url);
        debug!(
            model = %request.model,
            messages = transcript.len(),
            streaming = params.streaming(),
            "Sending Ollama chat request"
        );
        let response = http::send("ollama", &url, conn.client.post(&url).json(&body), conn.timeout).await?;

        let decoder = OllamaDecoder::new(self.transcripts.clone(), transcript);
        if params.streaming() {
            let (sender, stream) = ResponseStream::channel(64);
            spawn_pump("ollama", Box::pin(response.bytes_stream()), decoder, sender);
            Ok(stream)
        } else {
            let text = response
                .text()
                .await
                .map_err(|e| ProviderError::StreamInterrupted(format!("ollama response body: {e}")))?;
            let events = decoder.decode_complete(&text)?;
            Ok(ResponseStream::from_events(events.into_iter().map(Ok).collect()))
        }
    }

    async fn list_available_models(&self) -> Vec<String> {
        let Ok(conn) = self.connection() else {
            return Vec::new();
        };
        match self.fetch_tags(conn, conn.timeout).await {
            Ok(names) => {
                let mut models = Vec::with_capacity(names.len());
                for name in names {
                    // `llama3:latest` is also reachable as `llama3`.
                    if let Some(base) = name.strip_suffix(":latest") {
                        models.push(base.to_string());
                    }
                    models.push(name);
                }
                models
            }
            Err(e) => {
                warn!(error = %e, "Failed to list Ollama models");
                Vec::new()
            }
        }
    }
}

/// Map merged parameters onto Ollama's `options` object.
fn ollama_options(params: &ModelParams) -> Value {
    let mut options = Map::new();
    let mut put = |key: &str, value: Option<Value>| {
        if let Some(value) = value {
            options.insert(key.to_string(), value);
        }
    };
    put("temperature", params.temperature.map(|v| json!(v)));
    put("top_p", params.top_p.map(|v| json!(v)));
    put("top_k", params.top_k.map(|v| json!(v)));
    put("repeat_penalty", params.repeat_penalty.map(|v| json!(v)));
    put("presence_penalty", params.presence_penalty.map(|v| json!(v)));
    put("frequency_penalty", params.frequency_penalty.map(|v| json!(v)));
    put("mirostat", params.mirostat.map(|v| json!(v)));
    put("mirostat_tau", params.mirostat_tau.map(|v| json!(v)));
    put("mirostat_eta", params.mirostat_eta.map(|v| json!(v)));
    put("num_ctx", params.num_ctx.map(|v| json!(v)));
    put("num_batch", params.num_batch.map(|v| json!(v)));
    put("num_gpu", params.num_gpu.map(|v| json!(v)));
    put("num_thread", params.num_thread.map(|v| json!(v)));
    // A negative seed means "random", which is Ollama's default.
    put("seed", params.seed.filter(|s| *s >= 0).map(|v| json!(v)));
    put(
        "stop",
        params
            .stop_sequences
            .as_ref()
            .filter(|s| !s.is_empty())
            .map(|v| json!(v)),
    );
    Value::Object(options)
}

fn to_ollama_messages(instructions: &str, items: &[ConversationItem]) -> Vec<Value> {
    let mut messages = Vec::with_capacity(items.len() + 1);
    if !instructions.trim().is_empty() {
        messages.push(json!({ "role": "system", "content": instructions }));
    }

    for item in items {
        match item {
            ConversationItem::Message { role, content, .. } => {
                let text = item.text().unwrap_or_default();
                let images: Vec<&str> = content
                    .iter()
                    .filter_map(|part| match part {
                        // Ollama wants bare base64, without the data-URL prefix.
                        ContentPart::Image { image_url } => image_url
                            .split_once(";base64,")
                            .map(|(_, data)| data),
                        ContentPart::Text { .. } => None,
                    })
                    .collect();
                let role = match role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                };
                let mut message = json!({ "role": role, "content": text });
                if !images.is_empty() {
                    message["images"] = json!(images);
                }
                messages.push(message);
            }
            ConversationItem::FunctionCall { name, arguments, .. } => {
                let arguments: Value =
                    serde_json::from_str(arguments).unwrap_or_else(|_| json!({}));
                messages.push(json!({
                    "role": "assistant",
                    "content": "",
                    "tool_calls": [{ "function": { "name": name, "arguments": arguments } }],
                }));
            }
            ConversationItem::FunctionCallOutput { .. } => {
                messages.push(json!({
                    "role": "tool",
                    "content": item.output_payload().unwrap_or_default(),
                }));
            }
            ConversationItem::Reasoning { .. } => {}
        }
    }
    messages
}

// --- Ollama chat types (internal) ---

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Vec<ChatToolCall>,
}

#[derive(Debug, Deserialize)]
struct ChatToolCall {
    function: ChatFunction,
}

#[derive(Debug, Deserialize)]
struct ChatFunction {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Decodes Ollama's JSON-lines chat stream.
pub(crate) struct OllamaDecoder {
    response_id: String,
    text: TextAccumulator,
    tool_calls: Vec<ConversationItem>,
    complete: bool,
    transcripts: Arc<TranscriptCache>,
    transcript: Vec<ConversationItem>,
}

impl OllamaDecoder {
    pub(crate) fn new(transcripts: Arc<TranscriptCache>, transcript: Vec<ConversationItem>) -> Self {
        Self {
            response_id: new_item_id("resp"),
            text: TextAccumulator::new(),
            tool_calls: Vec::new(),
            complete: false,
            transcripts,
            transcript,
        }
    }

    fn parse(line: &str) -> Result<Option<ChatChunk>, ProviderError> {
        match serde_json::from_str::<ChatChunk>(line) {
            Ok(chunk) => match chunk.error {
                Some(error) => Err(ProviderError::api(500, error)),
                None => Ok(Some(chunk)),
            },
            Err(e) => {
                warn!(line = %line, error = %e, "Ignoring unparseable Ollama chunk");
                Ok(None)
            }
        }
    }

    fn absorb_tool_calls(&mut self, calls: Vec<ChatToolCall>) {
        for call in calls {
            let arguments = match call.function.arguments {
                Value::String(raw) => raw,
                Value::Null => "{}".to_string(),
                other => other.to_string(),
            };
            self.tool_calls.push(ConversationItem::function_call(
                new_item_id("call"),
                call.function.name,
                arguments,
            ));
        }
    }

    fn complete_events(&mut self) -> Vec<StreamingEvent> {
        self.complete = true;
        let mut output = Vec::new();
        if !self.text.is_empty() || self.tool_calls.is_empty() {
            output.push(self.text.to_item());
        }
        output.append(&mut self.tool_calls);

        let mut transcript = std::mem::take(&mut self.transcript);
        transcript.extend(output.iter().cloned());
        self.transcripts.record(&self.response_id, transcript);

        CompletedResponse {
            id: self.response_id.clone(),
            output,
            status: ResponseStatus::Completed,
        }
        .into_events()
    }

    /// A non-streaming body: one `done` per item and the `completed` event.
    pub(crate) fn decode_complete(mut self, body: &str) -> Result<Vec<StreamingEvent>, ProviderError> {
        if let Some(chunk) = Self::parse(body.trim())? {
            if let Some(message) = chunk.message {
                self.text.absorb(&message.content);
                self.absorb_tool_calls(message.tool_calls);
            }
        }
        Ok(self.complete_events())
    }
}

impl LineDecoder for OllamaDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamingEvent>, ProviderError> {
        let line = line.trim();
        if line.is_empty() {
            return Ok(Vec::new());
        }
        let Some(chunk) = Self::parse(line)? else {
            return Ok(Vec::new());
        };

        let mut events = Vec::new();
        if let Some(message) = chunk.message {
            events.extend(self.text.push(&message.content));
            self.absorb_tool_calls(message.tool_calls);
        }
        if chunk.done {
            events.extend(self.complete_events());
        }
        Ok(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamingEvent>, ProviderError> {
        if self.complete {
            return Ok(Vec::new());
        }
        debug!("Ollama stream ended without a done marker; finalizing response");
        Ok(self.complete_events())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

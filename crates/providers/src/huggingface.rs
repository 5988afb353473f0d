//! Hugging Face text-generation-inference (TGI) provider.
//!
//! TGI generates from a flat prompt and streams one token per server-sent
//! event. The adapter renders the conversation as `System:` / `User:` /
//! `Assistant:` turns and assembles the tokens into one assistant message.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use termpilot_config::HuggingFaceConfig;
use termpilot_core::item::new_item_id;
use termpilot_core::provider::*;
use termpilot_core::{ConversationItem, ProviderError, Role};
use tracing::{debug, warn};

use crate::http;
use crate::stream::{LineDecoder, TextAccumulator, spawn_pump};
use crate::transcript::TranscriptCache;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

struct Connection {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl Connection {
    fn authorize(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => builder.header("Authorization", format!("Bearer {key}")),
            None => builder,
        }
    }
}

pub struct HuggingFaceProvider {
    config: HuggingFaceConfig,
    transcripts: Arc<TranscriptCache>,
    connection: Option<Connection>,
}

impl HuggingFaceProvider {
    pub fn new(config: HuggingFaceConfig) -> Self {
        Self {
            config,
            transcripts: Arc::new(TranscriptCache::default()),
            connection: None,
        }
    }

    fn connection(&self) -> Result<&Connection, ProviderError> {
        self.connection.as_ref().ok_or_else(|| {
            ProviderError::NotConfigured("Hugging Face provider is not initialized".into())
        })
    }

    fn request_body(&self, prompt: String) -> Value {
        json!({
            "inputs": prompt,
            "parameters": {
                "max_new_tokens": self.config.max_new_tokens,
                "temperature": self.config.temperature,
                "top_p": self.config.top_p,
                "do_sample": true,
                "return_full_text": false,
            },
            "stream": true,
        })
    }
}

#[async_trait]
impl Provider for HuggingFaceProvider {
    fn kind(&self) -> ProviderKind {
        ProviderKind::HuggingFace
    }

    async fn initialize(&mut self, options: ProviderOptions) -> Result<(), ProviderError> {
        let base_url = options
            .base_url
            .unwrap_or_else(|| ProviderKind::HuggingFace.default_base_url().to_string())
            .trim_end_matches('/')
            .to_string();
        debug!(base_url = %base_url, "Initializing Hugging Face provider");
        self.connection = Some(Connection {
            client: http::build_client()?,
            base_url,
            api_key: options.api_key.filter(|k| !k.trim().is_empty()),
            timeout: options.timeout.unwrap_or(DEFAULT_TIMEOUT),
        });
        Ok(())
    }

    async fn create_streaming_response(
        &self,
        request: ResponseRequest,
    ) -> Result<ResponseStream, ProviderError> {
        let conn = self.connection()?;
        let transcript = self
            .transcripts
            .resolve(request.previous_response_id.as_deref(), &request.input);
        let prompt = build_prompt(&request.instructions, &transcript);

        let url = format!("{}/generate_stream", conn.base_url);
        debug!(prompt_chars = prompt.len(), "Sending TGI generate_stream request");
        let builder = conn
            .authorize(conn.client.post(&url))
            .header("Accept", "text/event-stream")
            .json(&self.request_body(prompt));
        let response = http::send("huggingface", &url, builder, conn.timeout).await?;

        let (sender, stream) = ResponseStream::channel(64);
        spawn_pump(
            "huggingface",
            Box::pin(response.bytes_stream()),
            TgiDecoder::new(self.transcripts.clone(), transcript),
            sender,
        );
        Ok(stream)
    }

    async fn list_available_models(&self) -> Vec<String> {
        let Ok(conn) = self.connection() else {
            return Vec::new();
        };
        let url = format!("{}/models", conn.base_url);
        let response = match http::send("huggingface", &url, conn.authorize(conn.client.get(&url)), conn.timeout).await {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, "Failed to list Hugging Face models");
                return Vec::new();
            }
        };

        #[derive(Deserialize)]
        struct ModelList {
            #[serde(default)]
            data: Vec<ModelEntry>,
        }
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum ModelEntry {
            Named(String),
            Object { id: String },
        }

        match response.json::<ModelList>().await {
            Ok(list) => list
                .data
                .into_iter()
                .map(|entry| match entry {
                    ModelEntry::Named(id) | ModelEntry::Object { id } => id,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Unparseable Hugging Face model list");
                Vec::new()
            }
        }
    }
}

/// Render a conversation as a plain-text prompt ending with `Assistant: `.
fn build_prompt(instructions: &str, items: &[ConversationItem]) -> String {
    let mut prompt = String::new();
    if !instructions.trim().is_empty() {
        prompt.push_str(&format!("System: {}\n", instructions.trim()));
    }
    for item in items {
        match item {
            ConversationItem::Message { role, .. } => {
                let speaker = match role {
                    Role::User => "User",
                    Role::Assistant => "Assistant",
                    Role::System => "System",
                };
                prompt.push_str(&format!("{speaker}: {}\n", item.text().unwrap_or_default()));
            }
            ConversationItem::FunctionCall { name, arguments, .. } => {
                prompt.push_str(&format!("Assistant: [called {name} with {arguments}]\n"));
            }
            ConversationItem::FunctionCallOutput { .. } => {
                prompt.push_str(&format!("Tool: {}\n", item.output_payload().unwrap_or_default()));
            }
            ConversationItem::Reasoning { .. } => {}
        }
    }
    prompt.push_str("Assistant: ");
    prompt
}

// --- TGI streaming types (internal) ---

#[derive(Debug, Deserialize)]
struct TgiChunk {
    #[serde(default)]
    token: Option<TgiToken>,
    #[serde(default)]
    generated_text: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_type: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TgiToken {
    #[serde(default)]
    text: String,
    #[serde(default)]
    special: bool,
}

/// Decodes TGI token events into one assistant message.
pub(crate) struct TgiDecoder {
    response_id: String,
    text: TextAccumulator,
    complete: bool,
    transcripts: Arc<TranscriptCache>,
    transcript: Vec<ConversationItem>,
}

impl TgiDecoder {
    pub(crate) fn new(transcripts: Arc<TranscriptCache>, transcript: Vec<ConversationItem>) -> Self {
        Self {
            response_id: new_item_id("resp"),
            text: TextAccumulator::new(),
            complete: false,
            transcripts,
            transcript,
        }
    }

    fn complete_events(&mut self) -> Vec<StreamingEvent> {
        self.complete = true;
        let message = self.text.to_item();

        let mut transcript = std::mem::take(&mut self.transcript);
        transcript.push(message.clone());
        self.transcripts.record(&self.response_id, transcript);

        CompletedResponse {
            id: self.response_id.clone(),
            output: vec![message],
            status: ResponseStatus::Completed,
        }
        .into_events()
    }
}

impl LineDecoder for TgiDecoder {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamingEvent>, ProviderError> {
        let trimmed = line.trim();
        if trimmed.is_empty() || trimmed.starts_with(':') || trimmed.starts_with("event:") {
            return Ok(Vec::new());
        }
        let data = trimmed.strip_prefix("data:").map(str::trim).unwrap_or(trimmed);

        let chunk = match serde_json::from_str::<TgiChunk>(data) {
            Ok(chunk) => chunk,
            // Some deployments stream bare text.
            Err(_) => return Ok(self.text.push(data)),
        };

        if let Some(error) = chunk.error {
            let status = match chunk.error_type.as_deref() {
                Some("validation") => 422,
                Some("overloaded") => 503,
                _ => 500,
            };
            return Err(ProviderError::ApiError {
                status_code: status,
                message: error,
                code: None,
                error_type: chunk.error_type,
                param: None,
                request_id: None,
            });
        }

        let mut events = Vec::new();
        if let Some(token) = chunk.token.filter(|t| !t.special) {
            events.extend(self.text.push(&token.text));
        }
        if chunk.generated_text.is_some() {
            events.extend(self.complete_events());
        }
        Ok(events)
    }

    fn finish(&mut self) -> Result<Vec<StreamingEvent>, ProviderError> {
        if self.complete {
            return Ok(Vec::new());
        }
        Ok(self.complete_events())
    }

    fn is_complete(&self) -> bool {
        self.complete
    }
}

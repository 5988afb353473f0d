//! Provider trait: the abstraction over LLM backends.
//!
//! A provider adapter turns a conversation into one streaming response with a
//! uniform event vocabulary, whatever the backend speaks on the wire:
//! optional `start`, zero or more `delta`s, one `done` per output item and
//! exactly one `completed` carrying every done item.
//!
//! Implementations: OpenAI Responses API, Ollama, Hugging Face TGI.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::error::ProviderError;
use crate::item::ConversationItem;

/// The backends termpilot knows how to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    #[default]
    OpenAi,
    Ollama,
    HuggingFace,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 3] = [Self::OpenAi, Self::Ollama, Self::HuggingFace];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
            Self::HuggingFace => "huggingface",
        }
    }

    pub fn default_base_url(&self) -> &'static str {
        match self {
            Self::OpenAi => "https://api.openai.com/v1",
            Self::Ollama => "http://localhost:11434/api",
            Self::HuggingFace => "http://localhost:8080",
        }
    }

    /// Models that are accepted without asking the backend.
    pub fn recommended_models(&self) -> &'static [&'static str] {
        match self {
            Self::OpenAi => &["o4-mini", "o3"],
            Self::Ollama => &["llama3", "llama2", "mistral"],
            Self::HuggingFace => &["mistral-7b-instruct", "gemma-7b-it"],
        }
    }

    /// Whether the model name is meaningful to the backend. A TGI server
    /// serves exactly one model, chosen by its URL.
    pub fn validates_models(&self) -> bool {
        !matches!(self, Self::HuggingFace)
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            "huggingface" | "hf" | "tgi" => Ok(Self::HuggingFace),
            other => Err(format!(
                "unknown provider '{other}' (expected openai, ollama or huggingface)"
            )),
        }
    }
}

/// Connection settings handed to [`Provider::initialize`].
#[derive(Clone, Default)]
pub struct ProviderOptions {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout: Option<Duration>,
}

impl fmt::Debug for ProviderOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderOptions")
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// A tool definition sent to the LLM so it knows what tools it can call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    /// The tool name
    pub name: String,

    /// Description of what the tool does
    pub description: String,

    /// JSON Schema describing the tool's parameters
    pub parameters: serde_json::Value,
}

/// One request for a streaming response.
#[derive(Debug, Clone)]
pub struct ResponseRequest {
    pub model: String,
    pub instructions: String,
    /// Items new since `previous_response_id`.
    pub input: Vec<ConversationItem>,
    pub previous_response_id: Option<String>,
    pub tools: Vec<ToolDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    #[default]
    Completed,
    Incomplete,
    Failed,
}

/// The terminal summary of a response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedResponse {
    pub id: String,
    pub output: Vec<ConversationItem>,
    #[serde(default)]
    pub status: ResponseStatus,
}

impl CompletedResponse {
    /// One `done` event per output item followed by the `completed` event.
    pub fn into_events(self) -> Vec<StreamingEvent> {
        let mut events: Vec<StreamingEvent> = self
            .output
            .iter()
            .cloned()
            .map(|item| StreamingEvent::OutputItemDone { item })
            .collect();
        events.push(StreamingEvent::Completed { response: self });
        events
    }
}

/// Normalized streaming vocabulary shared by every adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum StreamingEvent {
    #[serde(rename = "response.output_item.start")]
    OutputItemStart { item: ConversationItem },

    #[serde(rename = "response.output_item.delta")]
    OutputItemDelta { item_id: String, delta: String },

    #[serde(rename = "response.output_item.done")]
    OutputItemDone { item: ConversationItem },

    #[serde(rename = "response.completed")]
    Completed { response: CompletedResponse },
}

type EventResult = std::result::Result<StreamingEvent, ProviderError>;

/// Producer half of a [`ResponseStream`], held by an adapter's pump task.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::Sender<EventResult>,
    abort: CancellationToken,
}

impl EventSender {
    /// Deliver one event. Returns `false` once the consumer aborted or went away.
    pub async fn send(&self, event: EventResult) -> bool {
        if self.abort.is_cancelled() {
            return false;
        }
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => false,
            sent = self.tx.send(event) => sent.is_ok(),
        }
    }

    pub async fn send_all(&self, events: impl IntoIterator<Item = StreamingEvent>) -> bool {
        for event in events {
            if !self.send(Ok(event)).await {
                return false;
            }
        }
        true
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }

    /// Resolves when the consumer aborts the stream.
    pub async fn aborted(&self) {
        self.abort.cancelled().await
    }
}

/// A lazy, finite, non-restartable sequence of streaming events.
///
/// Aborting (or dropping) the stream stops the producer; no further events
/// are yielded after an abort.
pub struct ResponseStream {
    rx: mpsc::Receiver<EventResult>,
    abort: CancellationToken,
}

impl ResponseStream {
    pub fn channel(capacity: usize) -> (EventSender, ResponseStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let abort = CancellationToken::new();
        (
            EventSender {
                tx,
                abort: abort.clone(),
            },
            ResponseStream { rx, abort },
        )
    }

    /// A stream over events that are already known.
    pub fn from_events(events: Vec<EventResult>) -> Self {
        let (tx, rx) = mpsc::channel(events.len().max(1));
        for event in events {
            // Capacity equals the number of events.
            let _ = tx.try_send(event);
        }
        ResponseStream {
            rx,
            abort: CancellationToken::new(),
        }
    }

    pub async fn next_event(&mut self) -> Option<EventResult> {
        if self.abort.is_cancelled() {
            return None;
        }
        tokio::select! {
            biased;
            _ = self.abort.cancelled() => None,
            event = self.rx.recv() => event,
        }
    }

    pub fn abort(&self) {
        self.abort.cancel();
    }

    /// A handle that aborts this stream from elsewhere.
    pub fn abort_handle(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_cancelled()
    }
}

impl Drop for ResponseStream {
    fn drop(&mut self) {
        self.abort.cancel();
    }
}

/// The core Provider trait.
///
/// The turn loop owns exactly one adapter and tracks whether it has been
/// initialized; adapters never initialize themselves.
#[async_trait]
pub trait Provider: Send + Sync {
    fn kind(&self) -> ProviderKind;

    /// A human-readable name for this provider.
    fn name(&self) -> &str {
        self.kind().as_str()
    }

    /// Validate configuration and, for local servers, connectivity.
    async fn initialize(&mut self, options: ProviderOptions) -> std::result::Result<(), ProviderError>;

    /// Start one streaming response.
    async fn create_streaming_response(
        &self,
        request: ResponseRequest,
    ) -> std::result::Result<ResponseStream, ProviderError>;

    /// Best effort: `false` when the backend cannot be asked.
    async fn is_model_supported(&self, model: &str) -> bool {
        self.list_available_models()
            .await
            .iter()
            .any(|available| available == model)
    }

    /// Best effort: empty when the backend cannot be asked.
    async fn list_available_models(&self) -> Vec<String>;
}

//! Shared test helpers: a scripted provider, a recording sink and a
//! confirmer with a fixed answer.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use termpilot_core::provider::*;
use termpilot_core::{
    ApplyPatchCommand, CommandConfirmation, ConfirmationHandler, ConversationItem, ProviderError,
    Role,
};
use tokio::sync::Notify;

use crate::sink::{AgentEvent, AgentSink};

type EventResult = Result<StreamingEvent, ProviderError>;

/// What the provider does for one `create_streaming_response` call.
#[derive(Clone)]
pub enum Script {
    /// Yield these events, then end the stream.
    Respond(Vec<EventResult>),
    /// Yield these events, then stay open until the consumer aborts.
    Hang(Vec<StreamingEvent>),
    /// Fail to open the stream.
    Fail(ProviderError),
}

#[derive(Default)]
struct Inner {
    scripts: VecDeque<Script>,
    fallback: Option<Script>,
    requests: Vec<ResponseRequest>,
    models: Vec<String>,
    model_list_calls: usize,
    model_list_delay: Option<Duration>,
    init_error: Option<ProviderError>,
    initialize_calls: usize,
}

/// A provider that plays back scripted responses in order.
///
/// Clones share the script and the recorded requests, so a test can keep a
/// handle while the loop owns another.
#[derive(Clone)]
pub struct ScriptedProvider {
    kind: ProviderKind,
    inner: Arc<Mutex<Inner>>,
    request_seen: Arc<Notify>,
}

impl ScriptedProvider {
    pub fn new(kind: ProviderKind) -> Self {
        Self {
            kind,
            inner: Arc::new(Mutex::new(Inner::default())),
            request_seen: Arc::new(Notify::new()),
        }
    }

    pub fn then(self, script: Script) -> Self {
        self.inner.lock().unwrap().scripts.push_back(script);
        self
    }

    /// Used once the queued scripts run out.
    pub fn repeat(self, script: Script) -> Self {
        self.inner.lock().unwrap().fallback = Some(script);
        self
    }

    pub fn with_models(self, models: Vec<String>) -> Self {
        self.inner.lock().unwrap().models = models;
        self
    }

    pub fn with_model_list_delay(self, delay: Duration) -> Self {
        self.inner.lock().unwrap().model_list_delay = Some(delay);
        self
    }

    pub fn with_init_error(self, err: ProviderError) -> Self {
        self.inner.lock().unwrap().init_error = Some(err);
        self
    }

    pub fn requests(&self) -> Vec<ResponseRequest> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn attempts(&self) -> usize {
        self.inner.lock().unwrap().requests.len()
    }

    pub fn model_list_calls(&self) -> usize {
        self.inner.lock().unwrap().model_list_calls
    }

    pub fn initialize_calls(&self) -> usize {
        self.inner.lock().unwrap().initialize_calls
    }

    /// Resolves once a request has been made.
    pub async fn request_started(&self) {
        self.request_seen.notified().await
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    async fn initialize(&mut self, _options: ProviderOptions) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.initialize_calls += 1;
        match inner.init_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn create_streaming_response(
        &self,
        request: ResponseRequest,
    ) -> Result<ResponseStream, ProviderError> {
        let script = {
            let mut inner = self.inner.lock().unwrap();
            inner.requests.push(request);
            inner.scripts.pop_front().or_else(|| inner.fallback.clone())
        };
        self.request_seen.notify_one();

        match script {
            None => Err(ProviderError::InvalidResponse("no scripted response left".into())),
            Some(Script::Fail(err)) => Err(err),
            Some(Script::Respond(events)) => Ok(ResponseStream::from_events(events)),
            Some(Script::Hang(events)) => {
                let (sender, stream) = ResponseStream::channel(16);
                tokio::spawn(async move {
                    if sender.send_all(events).await {
                        sender.aborted().await;
                    }
                });
                Ok(stream)
            }
        }
    }

    async fn list_available_models(&self) -> Vec<String> {
        let (models, delay) = {
            let mut inner = self.inner.lock().unwrap();
            inner.model_list_calls += 1;
            (inner.models.clone(), inner.model_list_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        models
    }
}

/// Delta, done and completed events for one assistant message.
pub fn text_response(response_id: &str, text: &str) -> Vec<EventResult> {
    let item = ConversationItem::assistant_text(text);
    vec![
        Ok(StreamingEvent::OutputItemDelta {
            item_id: item.id().to_string(),
            delta: text.to_string(),
        }),
        Ok(StreamingEvent::OutputItemDone { item: item.clone() }),
        Ok(StreamingEvent::Completed {
            response: CompletedResponse {
                id: response_id.to_string(),
                output: vec![item],
                status: ResponseStatus::Completed,
            },
        }),
    ]
}

/// A response made of a single function call, streamed and then repeated in
/// the completed event.
pub fn call_response(response_id: &str, call_id: &str, name: &str, arguments: &str) -> Vec<EventResult> {
    let call = ConversationItem::function_call(call_id, name, arguments);
    vec![
        Ok(StreamingEvent::OutputItemDone { item: call.clone() }),
        Ok(StreamingEvent::Completed {
            response: CompletedResponse {
                id: response_id.to_string(),
                output: vec![call],
                status: ResponseStatus::Completed,
            },
        }),
    ]
}

/// Records every sink callback.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<AgentEvent>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<AgentEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn items(&self) -> Vec<ConversationItem> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                AgentEvent::Item { item } => Some(item),
                _ => None,
            })
            .collect()
    }

    pub fn texts_by(&self, role: Role) -> Vec<String> {
        self.items()
            .iter()
            .filter(|item| item.role() == Some(role))
            .filter_map(ConversationItem::text)
            .collect()
    }

    pub fn system_messages(&self) -> Vec<String> {
        self.texts_by(Role::System)
    }

    pub fn loading(&self) -> Vec<bool> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                AgentEvent::Loading { loading } => Some(loading),
                _ => None,
            })
            .collect()
    }

    pub fn response_ids(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                AgentEvent::LastResponseId { response_id } => Some(response_id),
                _ => None,
            })
            .collect()
    }
}

impl AgentSink for RecordingSink {
    fn on_item(&self, item: ConversationItem) {
        self.events.lock().unwrap().push(AgentEvent::Item { item });
    }

    fn on_loading(&self, loading: bool) {
        self.events.lock().unwrap().push(AgentEvent::Loading { loading });
    }

    fn on_last_response_id(&self, response_id: &str) {
        self.events.lock().unwrap().push(AgentEvent::LastResponseId {
            response_id: response_id.to_string(),
        });
    }
}

/// Answers every confirmation the same way and records what was asked.
pub struct ScriptedConfirmer {
    answer: CommandConfirmation,
    asked: Mutex<Vec<Vec<String>>>,
}

impl ScriptedConfirmer {
    pub fn new(answer: CommandConfirmation) -> Self {
        Self {
            answer,
            asked: Mutex::new(Vec::new()),
        }
    }

    pub fn asked(&self) -> Vec<Vec<String>> {
        self.asked.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConfirmationHandler for ScriptedConfirmer {
    async fn confirm(
        &self,
        command: &[String],
        _apply_patch: Option<&ApplyPatchCommand>,
    ) -> CommandConfirmation {
        self.asked.lock().unwrap().push(command.to_vec());
        self.answer.clone()
    }
}

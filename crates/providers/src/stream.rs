//! Byte stream → line → [`StreamingEvent`] plumbing.
//!
//! Every adapter reads its response body the same way: a spawned pump task
//! splits bytes into lines and hands each line to a backend-specific
//! [`LineDecoder`]. The pump stops as soon as the consumer aborts.

use std::fmt::Display;

use futures::{Stream, StreamExt};
use termpilot_core::item::new_item_id;
use termpilot_core::{ContentPart, ConversationItem, EventSender, ProviderError, Role, StreamingEvent};
use tracing::debug;

/// Splits a byte stream into lines. Works on bytes so that multi-byte UTF-8
/// sequences split across chunks decode correctly.
#[derive(Debug, Default)]
pub(crate) struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    /// Append a chunk and return every line it completed, without terminators.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            lines.push(text.trim_end_matches('\r').to_string());
        }
        lines
    }

    /// The trailing partial line, if any.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        let text = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
        (!text.trim().is_empty()).then_some(text)
    }
}

/// Backend-specific translation of response lines into events.
pub(crate) trait LineDecoder: Send + 'static {
    fn decode_line(&mut self, line: &str) -> Result<Vec<StreamingEvent>, ProviderError>;

    /// Called once the body ends. Either synthesizes the terminal events or
    /// reports a premature close.
    fn finish(&mut self) -> Result<Vec<StreamingEvent>, ProviderError>;

    /// `true` once the `completed` event has been produced.
    fn is_complete(&self) -> bool;
}

pub(crate) fn spawn_pump<S, B, E, D>(backend: &'static str, chunks: S, decoder: D, sender: EventSender)
where
    S: Stream<Item = Result<B, E>> + Send + Unpin + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Display + Send + 'static,
    D: LineDecoder,
{
    tokio::spawn(pump(backend, chunks, decoder, sender));
}

async fn pump<S, B, E, D>(backend: &'static str, mut chunks: S, mut decoder: D, sender: EventSender)
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
    D: LineDecoder,
{
    let mut lines = LineBuffer::default();
    loop {
        let next = tokio::select! {
            biased;
            _ = sender.aborted() => {
                debug!(backend, "Stream aborted by consumer");
                return;
            }
            next = chunks.next() => next,
        };

        match next {
            Some(Ok(chunk)) => {
                for line in lines.push(chunk.as_ref()) {
                    if !forward(&sender, decoder.decode_line(&line)).await {
                        return;
                    }
                    if decoder.is_complete() {
                        return;
                    }
                }
            }
            Some(Err(e)) => {
                let _ = sender
                    .send(Err(ProviderError::StreamInterrupted(format!(
                        "{backend} stream failed: {e}"
                    ))))
                    .await;
                return;
            }
            None => break,
        }
    }

    if let Some(rest) = lines.finish() {
        if !forward(&sender, decoder.decode_line(&rest)).await || decoder.is_complete() {
            return;
        }
    }
    let _ = forward(&sender, decoder.finish()).await;
}

/// Returns `false` when the pump should stop.
async fn forward(sender: &EventSender, decoded: Result<Vec<StreamingEvent>, ProviderError>) -> bool {
    match decoded {
        Ok(events) => sender.send_all(events).await,
        Err(e) => {
            let _ = sender.send(Err(e)).await;
            false
        }
    }
}

/// Builds one assistant message out of text deltas.
#[derive(Debug)]
pub(crate) struct TextAccumulator {
    item_id: String,
    text: String,
    started: bool,
}

impl TextAccumulator {
    pub(crate) fn new() -> Self {
        Self {
            item_id: new_item_id("msg"),
            text: String::new(),
            started: false,
        }
    }

    /// Record a delta; the first one is preceded by a `start` event.
    pub(crate) fn push(&mut self, delta: &str) -> Vec<StreamingEvent> {
        let mut events = Vec::new();
        if delta.is_empty() {
            return events;
        }
        if !self.started {
            self.started = true;
            events.push(StreamingEvent::OutputItemStart {
                item: self.item_with(String::new()),
            });
        }
        self.text.push_str(delta);
        events.push(StreamingEvent::OutputItemDelta {
            item_id: self.item_id.clone(),
            delta: delta.to_string(),
        });
        events
    }

    /// Record text without emitting events (non-streaming responses).
    pub(crate) fn absorb(&mut self, text: &str) {
        self.text.push_str(text);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub(crate) fn to_item(&self) -> ConversationItem {
        self.item_with(self.text.clone())
    }

    fn item_with(&self, text: String) -> ConversationItem {
        ConversationItem::Message {
            id: self.item_id.clone(),
            role: Role::Assistant,
            content: vec![ContentPart::Text { text }],
        }
    }
}

//! Where the turn loop delivers its output.
//!
//! The loop never returns conversation items; it pushes them to an
//! [`AgentSink`] as they become final. Callbacks may arrive after `run`
//! returned (a late flush) and must be cheap: they are invoked from timer
//! tasks as well as from the loop itself.

use serde::{Deserialize, Serialize};
use termpilot_core::ConversationItem;
use tokio::sync::mpsc;

pub trait AgentSink: Send + Sync {
    fn on_item(&self, item: ConversationItem);

    fn on_loading(&self, loading: bool);

    /// The id to pass as `previous_response_id` on the next turn. An empty
    /// string means the next turn starts a fresh conversation.
    fn on_last_response_id(&self, response_id: &str);

    /// Partial text of an item still being generated.
    fn on_delta(&self, _item_id: &str, _delta: &str) {}
}

/// Sink callbacks as data, for consumers on another task.
///
/// - `item`: a finished conversation item
/// - `loading`: the loop started or stopped working
/// - `last_response_id`: the response id for the next turn
/// - `delta`: partial text of an item in progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Item { item: ConversationItem },
    Loading { loading: bool },
    LastResponseId { response_id: String },
    Delta { item_id: String, delta: String },
}

impl AgentEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::Item { .. } => "item",
            Self::Loading { .. } => "loading",
            Self::LastResponseId { .. } => "last_response_id",
            Self::Delta { .. } => "delta",
        }
    }
}

/// Forwards every callback as an [`AgentEvent`] over an unbounded channel.
#[derive(Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<AgentEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn send(&self, event: AgentEvent) {
        // A closed receiver means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl AgentSink for ChannelSink {
    fn on_item(&self, item: ConversationItem) {
        self.send(AgentEvent::Item { item });
    }

    fn on_loading(&self, loading: bool) {
        self.send(AgentEvent::Loading { loading });
    }

    fn on_last_response_id(&self, response_id: &str) {
        self.send(AgentEvent::LastResponseId {
            response_id: response_id.to_string(),
        });
    }

    fn on_delta(&self, item_id: &str, delta: &str) {
        self.send(AgentEvent::Delta {
            item_id: item_id.to_string(),
            delta: delta.to_string(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serialization_item() {
        let event = AgentEvent::Item {
            item: ConversationItem::assistant_text("Hello"),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"item""#));
        assert!(json.contains(r#""text":"Hello""#));
    }

    #[test]
    fn event_serialization_last_response_id() {
        let event = AgentEvent::LastResponseId {
            response_id: "resp_1".into(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"type":"last_response_id","response_id":"resp_1"}"#);
        assert_eq!(event.event_type(), "last_response_id");
    }

    #[test]
    fn event_deserialization() {
        let event: AgentEvent = serde_json::from_str(r#"{"type":"loading","loading":true}"#).unwrap();
        assert_eq!(event, AgentEvent::Loading { loading: true });
    }

    #[tokio::test]
    async fn channel_sink_forwards_in_order() {
        let (sink, mut rx) = ChannelSink::new();
        sink.on_loading(true);
        sink.on_delta("msg_1", "Hi");
        sink.on_item(ConversationItem::assistant_text("Hi"));
        sink.on_loading(false);
        drop(sink);

        let mut types = Vec::new();
        while let Some(event) = rx.recv().await {
            types.push(event.event_type());
        }
        assert_eq!(types, vec!["loading", "delta", "item", "loading"]);
    }

    #[test]
    fn closed_receiver_is_ignored() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.on_loading(false);
    }
}

//! Conversation items, the unit of exchange between the turn loop, the
//! backend and the UI.
//!
//! A turn is a sequence of items: the user's message, the assistant's reply,
//! function calls issued by the model and the outputs the tool executor
//! produced for them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Generate a unique item id such as `msg_3f2a...`.
pub fn new_item_id(prefix: &str) -> String {
    format!("{prefix}_{}", Uuid::new_v4().simple())
}

/// The role of a message author.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One part of a message's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    Image { image_url: String },
}

/// Execution metadata attached to a function-call output.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ExecMetadata {
    pub exit_code: i32,
    pub duration_seconds: f64,
}

/// A single entry in a conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationItem {
    Message {
        id: String,
        role: Role,
        content: Vec<ContentPart>,
    },
    FunctionCall {
        id: String,
        call_id: String,
        name: String,
        /// Raw JSON arguments exactly as the model produced them.
        arguments: String,
    },
    FunctionCallOutput {
        id: String,
        call_id: String,
        output: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<ExecMetadata>,
    },
    Reasoning {
        id: String,
        #[serde(default)]
        summary: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        duration_ms: Option<u64>,
    },
}

impl ConversationItem {
    /// A text message with a fresh id.
    pub fn message(role: Role, text: impl Into<String>) -> Self {
        Self::Message {
            id: new_item_id("msg"),
            role,
            content: vec![ContentPart::Text { text: text.into() }],
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::message(Role::User, text)
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::message(Role::Assistant, text)
    }

    pub fn system_text(text: impl Into<String>) -> Self {
        Self::message(Role::System, text)
    }

    pub fn function_call(
        call_id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self::FunctionCall {
            id: new_item_id("fc"),
            call_id: call_id.into(),
            name: name.into(),
            arguments: arguments.into(),
        }
    }

    pub fn function_call_output(
        call_id: impl Into<String>,
        output: impl Into<String>,
        metadata: Option<ExecMetadata>,
    ) -> Self {
        Self::FunctionCallOutput {
            id: new_item_id("fco"),
            call_id: call_id.into(),
            output: output.into(),
            metadata,
        }
    }

    /// The output that answers a call the user interrupted before it ran.
    pub fn aborted_output(call_id: impl Into<String>) -> Self {
        Self::function_call_output(
            call_id,
            "aborted",
            Some(ExecMetadata {
                exit_code: 1,
                duration_seconds: 0.0,
            }),
        )
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Message { id, .. }
            | Self::FunctionCall { id, .. }
            | Self::FunctionCallOutput { id, .. }
            | Self::Reasoning { id, .. } => id,
        }
    }

    /// The call id of a function call or function-call output.
    pub fn call_id(&self) -> Option<&str> {
        match self {
            Self::FunctionCall { call_id, .. } | Self::FunctionCallOutput { call_id, .. } => {
                Some(call_id)
            }
            _ => None,
        }
    }

    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Message { role, .. } => Some(*role),
            _ => None,
        }
    }

    /// Concatenated text of a message, `None` for every other item kind.
    pub fn text(&self) -> Option<String> {
        match self {
            Self::Message { content, .. } => Some(
                content
                    .iter()
                    .filter_map(|part| match part {
                        ContentPart::Text { text } => Some(text.as_str()),
                        ContentPart::Image { .. } => None,
                    })
                    .collect(),
            ),
            _ => None,
        }
    }

    /// The string a backend receives for a function-call output.
    ///
    /// With metadata this is `{"output": ..., "metadata": {...}}` encoded as
    /// JSON; without it, the raw output.
    pub fn output_payload(&self) -> Option<String> {
        match self {
            Self::FunctionCallOutput {
                output,
                metadata: Some(metadata),
                ..
            } => Some(
                serde_json::json!({
                    "output": output,
                    "metadata": metadata,
                })
                .to_string(),
            ),
            Self::FunctionCallOutput { output, .. } => Some(output.clone()),
            _ => None,
        }
    }
}

//! # termpilot Core
//!
//! Domain types, traits, and error definitions for the termpilot coding agent.
//! This crate has no HTTP or process dependencies. It defines the model that
//! the provider adapters, the tool executor and the turn loop implement against.
//!
//! ## Layout
//!
//! - [`item`]: conversation items exchanged with a backend
//! - [`provider`]: the backend-agnostic adapter contract and its event stream
//! - [`approval`]: approval policy and the user-confirmation contract
//! - [`error`]: error taxonomy shared by every crate

pub mod approval;
pub mod error;
pub mod item;
pub mod provider;

// Re-export key types at crate root for ergonomics
pub use approval::{
    ApplyPatchCommand, ApprovalPolicy, CommandConfirmation, ConfirmationHandler, ReviewDecision,
};
pub use error::{Error, ProviderError, Result, ToolError};
pub use item::{ContentPart, ConversationItem, ExecMetadata, Role};
pub use provider::{
    CompletedResponse, EventSender, Provider, ProviderKind, ProviderOptions, ResponseRequest,
    ResponseStatus, ResponseStream, StreamingEvent, ToolDefinition,
};

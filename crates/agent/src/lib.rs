//! The turn loop of termpilot.
//!
//! A turn follows a **Request → Stream → Act** cycle:
//!
//! 1. **Send** the user's input (plus answers to any interrupted calls) to the
//!    configured provider
//! 2. **Stream** the response, delivering finished items to the sink after a
//!    short delay so that a cancel can still suppress them
//! 3. **If function calls**: run each through the tool executor, subject to
//!    the approval policy, and send the outputs back as the next request
//! 4. **Otherwise**: flush what remains and stop loading
//!
//! Transient failures are retried, rate limits back off, and failures the
//! user should know about end the turn with a system message.

pub mod catalog;
pub mod loop_runner;
pub mod retry;
pub mod sink;

#[cfg(test)]
mod test_helpers;

pub use catalog::ModelCatalog;
pub use loop_runner::{AgentLoop, ProviderFactory};
pub use retry::FailureClass;
pub use sink::{AgentEvent, AgentSink, ChannelSink};

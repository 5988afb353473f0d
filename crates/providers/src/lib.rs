//! LLM provider adapters for termpilot.
//!
//! All adapters implement the `termpilot_core::Provider` trait and emit the
//! same streaming vocabulary. The factory builds the one selected by
//! configuration.

pub mod factory;
mod http;
pub mod huggingface;
pub mod ollama;
pub mod openai;
mod stream;
pub mod transcript;

pub use factory::{create_provider, provider_options, provider_options_with};
pub use huggingface::HuggingFaceProvider;
pub use ollama::OllamaProvider;
pub use openai::OpenAiProvider;
pub use transcript::TranscriptCache;

//! Completion endpoints and the model-bound manager that drives them.

pub mod manager;
pub mod models;
pub mod parser;
pub mod provider;
pub mod providers;
pub mod stream;
pub mod types;

pub use manager::{
    clean_json, CompletionOptions, IntoMessages, LanguageModelManager, LlmSettings, MaxTokens,
    MIN_OUTPUT_TOKENS,
};
pub use models::{ModelRegistry, ModelSpec, KNOWN_MODELS};
pub use parser::{Parser, ParserBuilder};
pub use provider::{CompletionEndpoint, CompletionStream, LlmError, Result};
pub use providers::{OpenAiEndpoint, ScriptedEndpoint};
pub use stream::{collect_stream, StreamState, ToolCallAccumulator};
pub use types::{CompletionChunk, CompletionRequest, CompletionResponse, ToolCallDelta, WireMessage};

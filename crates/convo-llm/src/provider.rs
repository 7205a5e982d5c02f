use std::pin::Pin;

use async_trait::async_trait;
use convo_core::CoreError;
use futures::Stream;
use thiserror::Error;

use crate::types::{CompletionChunk, CompletionRequest, CompletionResponse};

#[derive(Error, Debug)]
pub enum LlmError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Stream error: {0}")]
    Stream(String),

    #[error("API error: {0}")]
    Api(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Model {0} is not registered")]
    UnknownModel(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Empty completion from {0}")]
    EmptyCompletion(String),

    #[error("Could not parse structured output: {0}")]
    Parse(String),

    #[error("Assertion failed: {0}")]
    Assertion(String),

    #[error("Completion timed out after {0} ms")]
    Timeout(u64),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl LlmError {
    /// Errors caused by setup rather than by the provider or the model.
    pub fn is_configuration(&self) -> bool {
        matches!(self, LlmError::UnknownModel(_) | LlmError::Configuration(_) | LlmError::Auth(_))
    }
}

pub type Result<T> = std::result::Result<T, LlmError>;

pub type CompletionStream = Pin<Box<dyn Stream<Item = Result<CompletionChunk>> + Send>>;

/// A chat completion backend.
#[async_trait]
pub trait CompletionEndpoint: Send + Sync {
    /// Identifier used in logs.
    fn name(&self) -> &str {
        "endpoint"
    }

    /// One-shot completion.
    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse>;

    /// Streamed completion. Implementations may end with a
    /// [`CompletionChunk::Final`] carrying the authoritative result.
    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream>;
}

//! Request-level errors and the ordered handler list tool failures go through.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use convo_core::CoreError;
use convo_llm::LlmError;
use thiserror::Error;

use crate::state::StateManager;

/// Coarse classification used to match handlers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Configuration,
    Validation,
    Provider,
    Tool,
    Store,
    MaxIterations,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Configuration => "configuration",
            ErrorKind::Validation => "validation",
            ErrorKind::Provider => "provider",
            ErrorKind::Tool => "tool",
            ErrorKind::Store => "store",
            ErrorKind::MaxIterations => "max_iterations",
        };
        f.write_str(name)
    }
}

/// An error that knows how to recover on its own.
///
/// Returned from a tool's `run`, it is handled before any registered
/// handler. The returned text becomes the tool message content.
#[async_trait]
pub trait SelfHandlingError: std::error::Error + Send + Sync {
    async fn handle(&self, state: &mut StateManager) -> Result<String>;
}

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Tool {tool} failed: {message}")]
    Tool { tool: String, message: String },

    #[error("Tool {0} is not registered")]
    MissingTool(String),

    #[error("Stopped after {0} completions")]
    MaxIterations(usize),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("{0}")]
    SelfHandled(Arc<dyn SelfHandlingError>),

    #[error(transparent)]
    Llm(#[from] LlmError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StateError {
    pub fn tool(tool: impl Into<String>, message: impl Into<String>) -> Self {
        StateError::Tool {
            tool: tool.into(),
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            StateError::Configuration(_) => ErrorKind::Configuration,
            StateError::Validation(_) | StateError::Serialization(_) => ErrorKind::Validation,
            StateError::Tool { .. } | StateError::MissingTool(_) | StateError::SelfHandled(_) => {
                ErrorKind::Tool
            }
            StateError::MaxIterations(_) => ErrorKind::MaxIterations,
            StateError::Storage(_) | StateError::Io(_) => ErrorKind::Store,
            StateError::Llm(e) if e.is_configuration() => ErrorKind::Configuration,
            StateError::Llm(LlmError::Parse(_) | LlmError::Assertion(_)) => ErrorKind::Validation,
            StateError::Llm(LlmError::Core(e)) | StateError::Core(e) => core_kind(e),
            StateError::Llm(_) => ErrorKind::Provider,
        }
    }
}

fn core_kind(error: &CoreError) -> ErrorKind {
    match error {
        CoreError::InvalidMessage(_) | CoreError::ToolSchema(_) | CoreError::Serialization(_) => {
            ErrorKind::Validation
        }
        _ => ErrorKind::Store,
    }
}

pub type Result<T> = std::result::Result<T, StateError>;

/// Recovery for a failed tool call. The returned text becomes the tool
/// message content.
#[async_trait]
pub trait ErrorHandler: Send + Sync {
    async fn handle(&self, error: &StateError, state: &mut StateManager) -> Result<String>;
}

/// Writes `Error: {error}` as the tool result.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorHandler;

#[async_trait]
impl ErrorHandler for DefaultErrorHandler {
    async fn handle(&self, error: &StateError, _state: &mut StateManager) -> Result<String> {
        Ok(default_tool_error(error))
    }
}

pub(crate) fn default_tool_error(error: &StateError) -> String {
    format!("Error: {}", error)
}

type Matcher = Arc<dyn Fn(&StateError) -> bool + Send + Sync>;

/// Ordered `(matcher, handler)` pairs; the first match wins.
#[derive(Clone, Default)]
pub struct ErrorHandlers {
    entries: Vec<(Matcher, Arc<dyn ErrorHandler>)>,
}

impl fmt::Debug for ErrorHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorHandlers")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl ErrorHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M, H>(&mut self, matcher: M, handler: H)
    where
        M: Fn(&StateError) -> bool + Send + Sync + 'static,
        H: ErrorHandler + 'static,
    {
        self.entries.push((Arc::new(matcher), Arc::new(handler)));
    }

    /// Match on [`StateError::kind`].
    pub fn on_kind<H>(&mut self, kind: ErrorKind, handler: H)
    where
        H: ErrorHandler + 'static,
    {
        self.register(move |e: &StateError| e.kind() == kind, handler);
    }

    pub fn find(&self, error: &StateError) -> Option<Arc<dyn ErrorHandler>> {
        self.entries
            .iter()
            .find(|(matches, _)| matches(error))
            .map(|(_, handler)| Arc::clone(handler))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

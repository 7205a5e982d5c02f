use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Message {0} has no remote")]
    NoRemote(String),

    #[error("Message not found: {0}")]
    MessageNotFound(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Search error: {0}")]
    Search(String),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Invalid tool schema: {0}")]
    ToolSchema(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, CoreError>;

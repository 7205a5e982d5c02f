//! Conversation primitives: messages, retrieved files, citation ordinals and
//! the store/search seams the rest of the workspace is written against.

pub mod error;
pub mod file;
pub mod message;
pub mod reference;
pub mod store;
pub mod tokenizer;
pub mod tools;

pub use error::{CoreError, Result};
pub use file::{Chunk, ChunkList, File, FileList};
pub use message::{
    DebugInfo, FunctionCall, KeepOptions, Message, MessageList, Remote, Role, ToolCall,
    ToolHistoryEntry,
};
pub use reference::{rereference, restore_citations, rewrite_citations, SourceRef, SourceRegistry};
pub use store::{
    ChatEvent, ContentSearch, InMemoryContentSearch, InMemoryMessageStore, JsonlMessageStore,
    MessageStore, SearchQuery, StoredMessage,
};
pub use tokenizer::{truncate_text, BpeTokenizer, CharTokenizer, SharedTokenizer, Tokenizer};
pub use tools::{schema_for, strip_titles, verify_tool_schemas, FunctionSchema, ToolSchema};

//! Messages, their debug snapshots, and token-budgeted lists of them.

pub mod debug;
pub mod list;
pub mod types;

pub use debug::DebugInfo;
pub use list::{KeepOptions, MessageList};
pub use types::{FunctionCall, Message, Remote, Role, ToolCall, ToolHistoryEntry, MESSAGE_OVERHEAD_TOKENS};

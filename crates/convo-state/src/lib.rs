//! Per-request state, the tool-calling loop and the module dispatcher.

pub mod app;
pub mod config;
pub mod error;
pub mod files;
pub mod logging;
pub mod runner;
pub mod state;
pub mod storage;
pub mod tools;

pub use app::{App, Module, EMPTY_ANSWER};
pub use config::{ModuleConfig, DEFAULT_FAILURE_MESSAGE};
pub use error::{
    DefaultErrorHandler, ErrorHandler, ErrorHandlers, ErrorKind, Result, SelfHandlingError,
    StateError,
};
pub use files::FileQuery;
pub use logging::{init_logging, Timer};
pub use runner::LoopOptions;
pub use state::StateManager;
pub use storage::Storage;
pub use tools::{DynTool, Fallback, HookSignal, Invocation, SharedTool, Tool, ToolContext, ToolOutput, ToolRegistry};

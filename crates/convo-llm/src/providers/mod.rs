pub mod openai;
pub mod scripted;
pub mod sse;

pub use openai::OpenAiEndpoint;
pub use scripted::ScriptedEndpoint;

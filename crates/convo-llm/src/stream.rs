//! Folding a completion stream into one response.

use std::collections::BTreeMap;

use convo_core::ToolCall;
use futures::StreamExt;
use uuid::Uuid;

use crate::provider::{CompletionStream, Result};
use crate::types::{CompletionChunk, CompletionResponse, ToolCallDelta};

#[derive(Debug, Default, Clone)]
struct PartialToolCall {
    id: Option<String>,
    name: Option<String>,
    arguments: String,
}

/// Merges tool call fragments by index.
///
/// The first fragment of a call usually carries id and name, later ones only
/// argument text.
#[derive(Debug, Default)]
pub struct ToolCallAccumulator {
    calls: BTreeMap<u32, PartialToolCall>,
}

impl ToolCallAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.calls.is_empty()
    }

    pub fn process(&mut self, deltas: &[ToolCallDelta]) {
        for delta in deltas {
            let entry = self.calls.entry(delta.index).or_default();
            if let Some(id) = delta.id.as_ref().filter(|id| !id.is_empty()) {
                entry.id = Some(id.clone());
            }
            if let Some(name) = delta.name.as_ref().filter(|n| !n.is_empty()) {
                entry.name = Some(name.clone());
            }
            if let Some(arguments) = &delta.arguments {
                entry.arguments.push_str(arguments);
            }
        }
    }

    /// Complete calls in index order. Calls without a name are dropped and
    /// calls without an id get a generated one.
    pub fn into_tool_calls(self) -> Vec<ToolCall> {
        self.calls
            .into_values()
            .filter_map(|partial| {
                let name = partial.name?;
                let id = partial
                    .id
                    .unwrap_or_else(|| format!("call_{}", Uuid::new_v4().simple()));
                Some(ToolCall::new(id, name, partial.arguments))
            })
            .collect()
    }
}

/// Stream state while it is being consumed.
#[derive(Debug, Default)]
pub struct StreamState {
    pub content: String,
    pub tool_calls: ToolCallAccumulator,
    pub authoritative: Option<CompletionResponse>,
    pub chunks: usize,
}

impl StreamState {
    /// Apply one chunk. Returns the token text when the chunk carried any.
    pub fn apply(&mut self, chunk: CompletionChunk) -> Option<String> {
        self.chunks += 1;
        match chunk {
            CompletionChunk::Token(token) if !token.is_empty() => {
                self.content.push_str(&token);
                Some(token)
            }
            CompletionChunk::Token(_) | CompletionChunk::Done => None,
            CompletionChunk::ToolCalls(deltas) => {
                self.tool_calls.process(&deltas);
                None
            }
            CompletionChunk::Final(response) => {
                self.authoritative = Some(response);
                None
            }
        }
    }

    /// The final chunk wins; otherwise what was accumulated.
    pub fn finish(self) -> CompletionResponse {
        let accumulated_calls = self.tool_calls.into_tool_calls();
        match self.authoritative {
            Some(mut response) => {
                if response.content.is_none() && !self.content.is_empty() {
                    response.content = Some(self.content);
                }
                if response.tool_calls.is_empty() {
                    response.tool_calls = accumulated_calls;
                }
                response
            }
            None => CompletionResponse {
                content: (!self.content.is_empty()).then_some(self.content),
                tool_calls: accumulated_calls,
                ..Default::default()
            },
        }
    }
}

/// Drain a stream without forwarding partial output.
pub async fn collect_stream(mut stream: CompletionStream) -> Result<CompletionResponse> {
    let mut state = StreamState::default();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk?;
        let done = chunk == CompletionChunk::Done;
        state.apply(chunk);
        if done {
            break;
        }
    }
    Ok(state.finish())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delta(index: u32, id: Option<&str>, name: Option<&str>, arguments: Option<&str>) -> ToolCallDelta {
        ToolCallDelta {
            index,
            id: id.map(str::to_string),
            name: name.map(str::to_string),
            arguments: arguments.map(str::to_string),
        }
    }

    #[test]
    fn accumulator_merges_partial_arguments() {
        let mut accumulator = ToolCallAccumulator::new();
        accumulator.process(&[delta(0, Some("call_1"), Some("Sum"), Some("{\"x\":"))]);
        accumulator.process(&[delta(0, None, None, Some("2,\"y\":3}"))]);

        let calls = accumulator.into_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].id, "call_1");
        assert_eq!(calls[0].function.arguments, "{\"x\":2,\"y\":3}");
    }

    #[test]
    fn accumulator_skips_calls_without_name_and_generates_ids() {
        let mut accumulator = ToolCallAccumulator::new();
        accumulator.process(&[
            delta(1, None, Some("Search"), Some("{}")),
            delta(0, Some("call_0"), None, Some("{}")),
        ]);
        let calls = accumulator.into_tool_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name(), "Search");
        assert!(calls[0].id.starts_with("call_"));
    }

    #[tokio::test]
    async fn final_chunk_is_authoritative() {
        let chunks: Vec<Result<CompletionChunk>> = vec![
            Ok(CompletionChunk::Token("Hel".into())),
            Ok(CompletionChunk::Token("lo".into())),
            Ok(CompletionChunk::Final(CompletionResponse::text("Hello!"))),
            Ok(CompletionChunk::Done),
        ];
        let response = collect_stream(Box::pin(futures::stream::iter(chunks))).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("Hello!"));
    }

    #[tokio::test]
    async fn accumulated_content_without_final_chunk() {
        let chunks: Vec<Result<CompletionChunk>> = vec![
            Ok(CompletionChunk::Token("a".into())),
            Ok(CompletionChunk::ToolCalls(vec![delta(0, Some("c"), Some("Sum"), Some("{}"))])),
            Ok(CompletionChunk::Token("b".into())),
            Ok(CompletionChunk::Done),
            Ok(CompletionChunk::Token("ignored".into())),
        ];
        let response = collect_stream(Box::pin(futures::stream::iter(chunks))).await.unwrap();
        assert_eq!(response.content.as_deref(), Some("ab"));
        assert_eq!(response.tool_calls.len(), 1);
    }

    #[tokio::test]
    async fn stream_errors_propagate() {
        let chunks: Vec<Result<CompletionChunk>> = vec![
            Ok(CompletionChunk::Token("a".into())),
            Err(crate::provider::LlmError::Stream("reset".into())),
        ];
        let result = collect_stream(Box::pin(futures::stream::iter(chunks))).await;
        assert!(matches!(result, Err(crate::provider::LlmError::Stream(_))));
    }
}

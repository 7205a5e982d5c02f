//! In-memory endpoint that replays queued responses.
//!
//! Used by tests across the workspace to drive completions and tool loops
//! without a network. Every request is recorded for later assertions.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream;

use crate::provider::{CompletionEndpoint, CompletionStream, LlmError, Result};
use crate::types::{CompletionChunk, CompletionRequest, CompletionResponse, ToolCallDelta};

#[derive(Debug, Default)]
pub struct ScriptedEndpoint {
    responses: Mutex<VecDeque<CompletionResponse>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedEndpoint {
    pub fn new(responses: impl IntoIterator<Item = CompletionResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: CompletionResponse) {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(response);
    }

    /// Requests received so far, oldest first.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn next(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.requests
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(request.clone());
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| LlmError::Api("scripted endpoint has no responses left".to_string()))
    }
}

/// Split a response into the chunks a streaming provider would send.
fn chunks_for(response: CompletionResponse) -> Vec<Result<CompletionChunk>> {
    let mut chunks: Vec<Result<CompletionChunk>> = Vec::new();

    if let Some(content) = response.content.as_deref() {
        for piece in content.split_inclusive(' ') {
            chunks.push(Ok(CompletionChunk::Token(piece.to_string())));
        }
    }
    if !response.tool_calls.is_empty() {
        let deltas = response
            .tool_calls
            .iter()
            .enumerate()
            .map(|(index, call)| ToolCallDelta {
                index: index as u32,
                id: Some(call.id.clone()),
                name: Some(call.function.name.clone()),
                arguments: Some(call.function.arguments.clone()),
            })
            .collect();
        chunks.push(Ok(CompletionChunk::ToolCalls(deltas)));
    }

    chunks.push(Ok(CompletionChunk::Final(response)));
    chunks.push(Ok(CompletionChunk::Done));
    chunks
}

#[async_trait]
impl CompletionEndpoint for ScriptedEndpoint {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        self.next(request)
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        let response = self.next(request)?;
        Ok(Box::pin(stream::iter(chunks_for(response))))
    }
}

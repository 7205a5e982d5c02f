//! OpenAI-compatible chat completions endpoint.
//!
//! The body builder never leaks internal message fields (ids, sources,
//! debug snapshots): only [`WireMessage`] values reach the provider.

use async_trait::async_trait;
use convo_core::ToolCall;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};

use super::sse::completion_stream_from_sse;
use crate::provider::{CompletionEndpoint, CompletionStream, LlmError, Result};
use crate::types::{CompletionChunk, CompletionRequest, CompletionResponse, ToolCallDelta};

pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

pub struct OpenAiEndpoint {
    client: Client,
    api_key: String,
    base_url: String,
}

impl OpenAiEndpoint {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            api_key: api_key.into(),
            base_url: DEFAULT_BASE_URL.to_string(),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn post(&self, body: &Value) -> Result<reqwest::Response> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let text = response.text().await?;
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(LlmError::Auth(format!("HTTP {}: {}", status, text)));
        }
        Err(LlmError::Api(format!("HTTP {}: {}", status, text)))
    }
}

/// Build an OpenAI chat completions body from a request.
pub fn build_chat_body(request: &CompletionRequest) -> Value {
    let mut body = json!({
        "model": request.model,
        "messages": request.messages,
        "stream": request.stream,
    });

    if !request.tools.is_empty() {
        body["tools"] = json!(request.tools);
    }
    if let Some(name) = &request.tool_choice {
        body["tool_choice"] = json!({"type": "function", "function": {"name": name}});
    }
    if let Some(schema) = &request.response_schema {
        body["response_format"] = json!({
            "type": "json_schema",
            "json_schema": {"name": "response", "schema": schema, "strict": false},
        });
    }
    if let Some(temperature) = request.temperature {
        body["temperature"] = json!(temperature);
    }
    if let Some(seed) = request.seed {
        body["seed"] = json!(seed);
    }
    if let Some(max_tokens) = request.max_tokens {
        body["max_tokens"] = json!(max_tokens);
    }
    if let Some(max_tokens) = request.max_completion_tokens {
        body["max_completion_tokens"] = json!(max_tokens);
    }

    body
}

// --- response parsing ---

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<StreamToolCallDelta>>,
}

#[derive(Debug, Deserialize)]
struct StreamToolCallDelta {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    function: Option<StreamFunctionDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamFunctionDelta {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<String>,
}

/// Parse a non-streamed completion body.
pub fn parse_chat_response(body: &str) -> Result<CompletionResponse> {
    let response: ChatResponse = serde_json::from_str(body)?;
    let choice = response
        .choices
        .into_iter()
        .next()
        .ok_or_else(|| LlmError::Api("response contained no choices".to_string()))?;

    Ok(CompletionResponse {
        content: choice.message.content,
        tool_calls: choice.message.tool_calls,
        structured: None,
        finish_reason: choice.finish_reason,
    })
}

/// Parse one SSE `data:` payload. `Ok(None)` for chunks that carry nothing.
pub fn parse_stream_data(data: &str) -> Result<Option<CompletionChunk>> {
    let data = data.trim();
    if data.is_empty() {
        return Ok(None);
    }
    if data == "[DONE]" {
        return Ok(Some(CompletionChunk::Done));
    }

    let chunk: StreamChunk = serde_json::from_str(data)?;
    let Some(choice) = chunk.choices.into_iter().next() else {
        return Ok(None);
    };

    if let Some(tool_calls) = choice.delta.tool_calls.filter(|calls| !calls.is_empty()) {
        let deltas = tool_calls
            .into_iter()
            .map(|call| {
                let (name, arguments) = match call.function {
                    Some(function) => (function.name, function.arguments),
                    None => (None, None),
                };
                ToolCallDelta {
                    index: call.index,
                    id: call.id,
                    name,
                    arguments,
                }
            })
            .collect();
        return Ok(Some(CompletionChunk::ToolCalls(deltas)));
    }

    Ok(choice
        .delta
        .content
        .filter(|content| !content.is_empty())
        .map(CompletionChunk::Token))
}

#[async_trait]
impl CompletionEndpoint for OpenAiEndpoint {
    fn name(&self) -> &str {
        "openai"
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let mut body = build_chat_body(request);
        body["stream"] = json!(false);

        log::debug!("POST {}/chat/completions model={}", self.base_url, request.model);
        let response = self.post(&body).await?;
        let text = response.text().await?;
        parse_chat_response(&text)
    }

    async fn stream(&self, request: &CompletionRequest) -> Result<CompletionStream> {
        let mut body = build_chat_body(request);
        body["stream"] = json!(true);

        log::debug!(
            "POST {}/chat/completions model={} (stream)",
            self.base_url,
            request.model
        );
        let response = self.post(&body).await?;
        Ok(completion_stream_from_sse(response, |_event, data| parse_stream_data(data)))
    }
}

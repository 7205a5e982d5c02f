//! Model-bound completion dispatch.
//!
//! [`LanguageModelManager`] owns the model registry lookup, context
//! reformatting, payload construction, streaming into an output message,
//! and the single corrective retry for structured output.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use convo_core::{
    rewrite_citations, schema_for, verify_tool_schemas, DebugInfo, KeepOptions, Message,
    BpeTokenizer, MessageList, Role, SharedTokenizer, SourceRef, ToolCall, ToolSchema,
};
use futures::StreamExt;
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::models::{ModelRegistry, ModelSpec};
use crate::parser::ParserBuilder;
use crate::provider::{CompletionEndpoint, LlmError, Result};
use crate::stream::StreamState;
use crate::types::{CompletionChunk, CompletionRequest, CompletionResponse, WireMessage};

/// Smallest output allowance ever requested.
pub const MIN_OUTPUT_TOKENS: u32 = 256;

const SCHEMA_CORRECTION: &str = "Your previous reply did not match the required JSON schema";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MaxTokens {
    /// Whatever the window leaves after the prompt, capped by the model's
    /// output limit.
    #[default]
    Auto,
    Fixed(u32),
}

impl MaxTokens {
    pub fn resolve(&self, spec: &ModelSpec, prompt_tokens: usize) -> u32 {
        match self {
            MaxTokens::Fixed(n) => *n,
            MaxTokens::Auto => {
                let prompt = u32::try_from(prompt_tokens).unwrap_or(u32::MAX);
                let available = spec.input_limit.saturating_sub(prompt);
                spec.output_limit.min(available).max(MIN_OUTPUT_TOKENS)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub temperature: Option<f32>,
    pub seed: Option<u64>,
    pub timeout: Duration,
    pub allow_streaming: bool,
    pub keep: KeepOptions,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            temperature: Some(0.0),
            seed: None,
            timeout: Duration::from_millis(60_000),
            allow_streaming: true,
            keep: KeepOptions::new(2, Some(10)).with_notice(KeepOptions::DEFAULT_NOTICE),
        }
    }
}

/// Anything that can become the message list of a completion.
pub trait IntoMessages {
    fn into_messages(self, tokenizer: &SharedTokenizer) -> Result<MessageList>;
}

impl IntoMessages for MessageList {
    fn into_messages(self, tokenizer: &SharedTokenizer) -> Result<MessageList> {
        Ok(self.with_tokenizer(tokenizer.clone()))
    }
}

impl IntoMessages for &MessageList {
    fn into_messages(self, tokenizer: &SharedTokenizer) -> Result<MessageList> {
        Ok(self.clone().with_tokenizer(tokenizer.clone()))
    }
}

impl IntoMessages for Vec<Message> {
    fn into_messages(self, tokenizer: &SharedTokenizer) -> Result<MessageList> {
        Ok(MessageList::from_messages(self, tokenizer.clone()))
    }
}

#[derive(Debug, Deserialize)]
struct RawMessage {
    role: Role,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<ToolCall>,
    #[serde(default)]
    tool_call_id: Option<String>,
}

/// Raw provider-style JSON messages (`{"role": "user", "content": "..."}`).
impl IntoMessages for Vec<Value> {
    fn into_messages(self, tokenizer: &SharedTokenizer) -> Result<MessageList> {
        let messages = self
            .into_iter()
            .map(|value| -> Result<Message> {
                let raw: RawMessage = serde_json::from_value(value)?;
                Ok(Message::try_new(raw.role, raw.content, raw.tool_calls, raw.tool_call_id)?)
            })
            .collect::<Result<Vec<Message>>>()?;
        Ok(MessageList::from_messages(messages, tokenizer.clone()))
    }
}

/// Per-call options for [`LanguageModelManager::complete`].
#[derive(Debug, Default)]
pub struct CompletionOptions<'a> {
    pub tools: Vec<ToolSchema>,
    /// Force the model to call this tool.
    pub tool_choice: Option<String>,
    /// JSON schema the reply must satisfy.
    pub schema: Option<Value>,
    pub max_tokens: MaxTokens,
    /// Message to stream the reply into.
    pub out: Option<&'a mut Message>,
    /// Sources the model may cite as `[sourceN]`, by ordinal.
    pub search_context: Vec<SourceRef>,
    pub raise_on_empty_completion: bool,
    pub temperature: Option<f32>,
    pub seed: Option<u64>,
    pub allow_streaming: Option<bool>,
    /// Text `out` starts with, ahead of the reply.
    pub start_text: String,
}

impl<'a> CompletionOptions<'a> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tools(mut self, tools: Vec<ToolSchema>) -> Self {
        self.tools = tools;
        self
    }

    pub fn tool_choice(mut self, name: impl Into<String>) -> Self {
        self.tool_choice = Some(name.into());
        self
    }

    pub fn schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }

    pub fn max_tokens(mut self, max_tokens: MaxTokens) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn out(mut self, out: &'a mut Message) -> Self {
        self.out = Some(out);
        self
    }

    pub fn search_context(mut self, sources: Vec<SourceRef>) -> Self {
        self.search_context = sources;
        self
    }

    pub fn raise_on_empty_completion(mut self) -> Self {
        self.raise_on_empty_completion = true;
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn allow_streaming(mut self, allow: bool) -> Self {
        self.allow_streaming = Some(allow);
        self
    }

    pub fn start_text(mut self, text: impl Into<String>) -> Self {
        self.start_text = text.into();
        self
    }
}

/// Strip surrounding code fences (and a `json` tag) from model output.
pub fn clean_json(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

type Validator<'v> = &'v (dyn Fn(&Value) -> std::result::Result<(), String> + Send + Sync);

/// Accept a JSON object carrying every key `schema` requires.
fn check_required(schema: &Value) -> impl Fn(&Value) -> std::result::Result<(), String> + Send + Sync + '_ {
    move |value: &Value| {
        let object = value
            .as_object()
            .ok_or_else(|| "expected a JSON object".to_string())?;
        let required = schema
            .get("required")
            .and_then(Value::as_array)
            .map(|keys| keys.iter().filter_map(Value::as_str).collect::<Vec<_>>())
            .unwrap_or_default();
        match required.into_iter().find(|key| !object.contains_key(*key)) {
            Some(missing) => Err(format!("missing required field `{}`", missing)),
            None => Ok(()),
        }
    }
}

fn parse_structured(content: Option<&str>, validate: Validator<'_>) -> std::result::Result<Value, String> {
    let text = clean_json(content.unwrap_or(""));
    if text.is_empty() {
        return Err("empty reply".to_string());
    }
    let value: Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    validate(&value)?;
    Ok(value)
}

#[derive(Clone)]
pub struct LanguageModelManager {
    endpoint: Arc<dyn CompletionEndpoint>,
    registry: Arc<ModelRegistry>,
    tokenizer: SharedTokenizer,
    model: String,
    settings: LlmSettings,
}

impl std::fmt::Debug for LanguageModelManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageModelManager")
            .field("endpoint", &self.endpoint.name())
            .field("model", &self.model)
            .field("settings", &self.settings)
            .finish()
    }
}

impl LanguageModelManager {
    pub fn new(endpoint: Arc<dyn CompletionEndpoint>, model: impl Into<String>) -> Self {
        Self {
            endpoint,
            registry: Arc::new(ModelRegistry::new()),
            tokenizer: BpeTokenizer::shared(),
            model: model.into(),
            settings: LlmSettings::default(),
        }
    }

    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_tokenizer(mut self, tokenizer: SharedTokenizer) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn with_settings(mut self, settings: LlmSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn settings(&self) -> &LlmSettings {
        &self.settings
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn tokenizer(&self) -> &SharedTokenizer {
        &self.tokenizer
    }

    pub fn endpoint(&self) -> &Arc<dyn CompletionEndpoint> {
        &self.endpoint
    }

    /// Add or override a model entry. Clones sharing the registry are not
    /// affected.
    pub fn register(&mut self, spec: ModelSpec) {
        Arc::make_mut(&mut self.registry).register(spec);
    }

    /// A manager bound to another model; `self` is unchanged.
    pub fn using(&self, model: impl Into<String>) -> Self {
        let mut manager = self.clone();
        manager.model = model.into();
        manager
    }

    pub fn spec(&self) -> Result<ModelSpec> {
        self.registry
            .get(&self.model)
            .ok_or_else(|| LlmError::UnknownModel(self.model.clone()))
    }

    /// Structured-output helper builder.
    pub fn parser(&self) -> ParserBuilder<'_> {
        ParserBuilder::new(self)
    }

    /// Dedupe system messages, drop empty assistant turns and fit the
    /// window minus the output reservation.
    pub fn reformat(&self, messages: &MessageList) -> Result<MessageList> {
        let spec = self.spec()?;
        self.reformat_for(&spec, messages)
    }

    fn reformat_for(&self, spec: &ModelSpec, messages: &MessageList) -> Result<MessageList> {
        let budget = spec.prompt_budget();
        if budget == 0 {
            return Err(LlmError::Configuration(format!(
                "model {} reserves its whole window ({}) for output",
                spec.name, spec.input_limit
            )));
        }
        let cleaned = messages
            .dedup_system()
            .drop_empty_assistants()
            .with_tokenizer(self.tokenizer.clone());
        Ok(cleaned.keep(budget as usize, &self.settings.keep))
    }

    /// Provider payload, with `developer` in place of `system` when the
    /// model wants it.
    pub fn to_wire(&self, spec: &ModelSpec, messages: &MessageList) -> Vec<WireMessage> {
        messages
            .iter()
            .map(|m| {
                let role = match m.role {
                    Role::System if spec.developer_role => "developer",
                    other => other.as_str(),
                };
                WireMessage {
                    role: role.to_string(),
                    content: m.content.clone(),
                    tool_calls: m.tool_calls.clone(),
                    tool_call_id: m.tool_call_id.clone(),
                }
            })
            .collect()
    }

    /// Run one completion.
    ///
    /// With `schema`, the reply must be a JSON object holding every required
    /// key; one corrective retry is made before failing with
    /// [`LlmError::Parse`]. The returned message keeps raw `[sourceN]`
    /// markers; `out`, when given, receives the rewritten links.
    pub async fn complete(
        &self,
        messages: impl IntoMessages,
        options: CompletionOptions<'_>,
    ) -> Result<Message> {
        let schema = options.schema.clone();
        let (message, _) = match schema.as_ref() {
            Some(schema) => {
                let validate = check_required(schema);
                self.complete_inner(messages, options, Some(&validate as Validator<'_>))
                    .await?
            }
            None => self.complete_inner(messages, options, None).await?,
        };
        Ok(message)
    }

    /// Structured completion deserialised into `T`. The schema is derived
    /// from `T` unless `options` already carries one.
    pub async fn complete_into<T>(
        &self,
        messages: impl IntoMessages,
        mut options: CompletionOptions<'_>,
    ) -> Result<T>
    where
        T: DeserializeOwned + JsonSchema,
    {
        if options.schema.is_none() {
            options.schema = Some(schema_for::<T>());
        }
        let validate = |value: &Value| {
            serde_json::from_value::<T>(value.clone())
                .map(|_| ())
                .map_err(|e| e.to_string())
        };
        let (_, structured) = self
            .complete_inner(messages, options, Some(&validate as Validator<'_>))
            .await?;
        let value = structured.ok_or_else(|| LlmError::Parse("no structured output".to_string()))?;
        serde_json::from_value(value).map_err(|e| LlmError::Parse(e.to_string()))
    }

    async fn complete_inner(
        &self,
        messages: impl IntoMessages,
        options: CompletionOptions<'_>,
        validate: Option<Validator<'_>>,
    ) -> Result<(Message, Option<Value>)> {
        let spec = self.spec()?;
        let messages = messages.into_messages(&self.tokenizer)?;
        let context = self.reformat_for(&spec, &messages)?;

        let CompletionOptions {
            tools,
            tool_choice,
            schema,
            max_tokens,
            mut out,
            search_context,
            raise_on_empty_completion,
            temperature,
            seed,
            allow_streaming,
            start_text,
        } = options;

        verify_tool_schemas(&tools)?;
        if let Some(choice) = tool_choice.as_deref() {
            if !tools.iter().any(|t| t.name() == choice) {
                return Err(LlmError::Configuration(format!(
                    "tool_choice {} is not among the offered tools",
                    choice
                )));
            }
        }

        let prompt_tokens = context.token_count();
        let output_tokens = max_tokens.resolve(&spec, prompt_tokens);
        // Reasoning models take `max_completion_tokens` and reject a temperature.
        let (temperature, max_tokens, max_completion_tokens) = if spec.developer_role {
            (None, None, Some(output_tokens))
        } else {
            (temperature.or(self.settings.temperature), Some(output_tokens), None)
        };
        let request = CompletionRequest {
            model: spec.wire_name().to_string(),
            messages: self.to_wire(&spec, &context),
            tools,
            tool_choice,
            response_schema: schema,
            temperature,
            seed: seed.or(self.settings.seed),
            max_tokens,
            max_completion_tokens,
            stream: false,
        };
        log::debug!(
            "Completion with {} ({} messages, {} prompt tokens, {} tools)",
            request.model,
            request.messages.len(),
            prompt_tokens,
            request.tools.len()
        );

        let streaming = out.is_some() && allow_streaming.unwrap_or(self.settings.allow_streaming);
        let (mut response, streamed) = if streaming {
            (self.dispatch_stream(&request, out.as_deref_mut(), &start_text).await?, true)
        } else {
            (self.dispatch(&request).await?, false)
        };

        let mut structured = None;
        if let Some(validate) = validate {
            match parse_structured(response.content.as_deref(), validate) {
                Ok(value) => structured = Some(value),
                Err(reason) => {
                    log::warn!("Structured reply from {} rejected: {}; retrying once", spec.name, reason);
                    let retry = self.correction_request(&spec, &request, &response, &reason);
                    response = self.dispatch(&retry).await?;
                    let value = parse_structured(response.content.as_deref(), validate)
                        .map_err(LlmError::Parse)?;
                    structured = Some(value);
                }
            }
            response.structured = structured.clone();
        }

        if raise_on_empty_completion && response.is_empty() {
            return Err(LlmError::EmptyCompletion(spec.name.clone()));
        }

        let text = response.content.clone().unwrap_or_default();
        let citations = if search_context.is_empty() {
            BTreeMap::new()
        } else {
            rewrite_citations(&text, &search_context).1
        };

        if let Some(out) = out {
            if streamed || !text.is_empty() {
                self.reconcile(out, &start_text, &text, &search_context).await?;
            }
        }

        let mut message = Message::assistant_with_tool_calls(response.content, response.tool_calls)
            .with_sources(search_context);
        message.citations = citations;
        Ok((message, structured))
    }

    /// Final write into `out`: citation links, `_sources`/`_citations`
    /// snapshots, then one push.
    async fn reconcile(
        &self,
        out: &mut Message,
        start_text: &str,
        text: &str,
        sources: &[SourceRef],
    ) -> Result<()> {
        if sources.is_empty() {
            out.content = Some(format!("{}{}", start_text, text));
        } else {
            let (rendered, citations) = rewrite_citations(text, sources);
            out.content = Some(format!("{}{}", start_text, rendered));
            out.sources = sources.to_vec();
            out.debug.set_as(DebugInfo::SOURCES, &sources)?;
            out.debug.set_as(DebugInfo::CITATIONS, &citations)?;
            out.citations = citations;
        }
        out.push().await?;
        Ok(())
    }

    fn correction_request(
        &self,
        spec: &ModelSpec,
        request: &CompletionRequest,
        response: &CompletionResponse,
        reason: &str,
    ) -> CompletionRequest {
        let mut retry = request.clone();
        retry.stream = false;
        retry.messages.push(WireMessage {
            role: Role::Assistant.as_str().to_string(),
            content: Some(response.content.clone().unwrap_or_default()),
            tool_calls: Vec::new(),
            tool_call_id: None,
        });
        let role = if spec.developer_role { "developer" } else { Role::System.as_str() };
        retry.messages.push(WireMessage {
            role: role.to_string(),
            content: Some(format!(
                "{} ({}). Reply again with only a JSON object that matches the schema.",
                SCHEMA_CORRECTION, reason
            )),
            tool_calls: Vec::new(),
            tool_call_id: None,
        });
        retry
    }

    async fn dispatch(&self, request: &CompletionRequest) -> Result<CompletionResponse> {
        let timeout = self.settings.timeout;
        tokio::time::timeout(timeout, self.endpoint.complete(request))
            .await
            .map_err(|_| LlmError::Timeout(timeout.as_millis() as u64))?
    }

    /// Stream into `out`, pushing every partial to the store. The final
    /// chunk wins over what was accumulated.
    async fn dispatch_stream(
        &self,
        request: &CompletionRequest,
        out: Option<&mut Message>,
        start_text: &str,
    ) -> Result<CompletionResponse> {
        let Some(out) = out else {
            return self.dispatch(request).await;
        };
        let mut request = request.clone();
        request.stream = true;

        let timeout = self.settings.timeout;
        let endpoint = self.endpoint.clone();
        let consume = async move {
            let mut stream = endpoint.stream(&request).await?;
            let mut state = StreamState::default();
            out.content = Some(start_text.to_string());

            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                let done = chunk == CompletionChunk::Done;
                if let Some(token) = state.apply(chunk) {
                    out.content.get_or_insert_with(String::new).push_str(&token);
                    out.push().await?;
                }
                if done {
                    break;
                }
            }
            log::debug!("Stream finished after {} chunks", state.chunks);
            Ok::<CompletionResponse, LlmError>(state.finish())
        };

        tokio::time::timeout(timeout, consume)
            .await
            .map_err(|_| LlmError::Timeout(timeout.as_millis() as u64))?
    }
}

//! The bounded completion / tool-call loop.
//!
//! Each iteration asks the model for a completion. A reply without tool
//! calls ends the loop. Otherwise every call is executed in the order the
//! model emitted it, exactly one tool message is appended per call, and the
//! model is asked again. The loop never makes more completions than
//! `function_call_max_iterations`.

use std::sync::Arc;

use convo_core::Message;
use convo_llm::CompletionOptions;
use serde_json::Value;

use crate::error::{default_tool_error, Result, StateError};
use crate::logging::Timer;
use crate::state::StateManager;
use crate::tools::ToolContext;

/// Per-run overrides for [`StateManager::run_loop_with`].
#[derive(Debug, Clone, Default)]
pub struct LoopOptions {
    /// Force this tool on the first completion only.
    pub tool_choice: Option<String>,
    pub raise_on_empty_completion: bool,
    /// Defaults to `function_call_max_iterations`.
    pub max_iterations: Option<usize>,
    /// Text the output message starts with on every completion.
    pub start_text: Option<String>,
}

impl LoopOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tool_choice(mut self, name: impl Into<String>) -> Self {
        self.tool_choice = Some(name.into());
        self
    }

    pub fn raise_on_empty_completion(mut self) -> Self {
        self.raise_on_empty_completion = true;
        self
    }

    pub fn max_iterations(mut self, max: usize) -> Self {
        self.max_iterations = Some(max);
        self
    }

    pub fn start_text(mut self, text: impl Into<String>) -> Self {
        self.start_text = Some(text.into());
        self
    }
}

impl StateManager {
    pub async fn run_loop(&mut self) -> Result<Message> {
        self.run_loop_with(LoopOptions::default()).await
    }

    /// Run the loop, streaming every completion into the output message.
    ///
    /// Returns the last reply. When the cap is reached while the model is
    /// still calling tools, that reply still carries its tool calls (whose
    /// tools were executed) unless `raise_on_max_iterations` is set.
    pub async fn run_loop_with(&mut self, options: LoopOptions) -> Result<Message> {
        let max = options
            .max_iterations
            .unwrap_or(self.config.function_call_max_iterations);
        if max == 0 {
            return Err(StateError::Configuration(
                "function_call_max_iterations must be at least 1".to_string(),
            ));
        }

        self.ensure_output().await?;
        let tools = self.tools.schemas();
        let mut last = None;

        for iteration in 0..max {
            log::debug!(
                "[{}] Loop iteration {}/{} ({} messages in context)",
                self.chat_id,
                iteration + 1,
                max,
                self.context.len()
            );

            let mut completion = CompletionOptions::new().tools(tools.clone());
            if iteration == 0 {
                if let Some(choice) = options.tool_choice.as_ref() {
                    completion = completion.tool_choice(choice.clone());
                }
            }
            if options.raise_on_empty_completion {
                completion = completion.raise_on_empty_completion();
            }
            if let Some(text) = options.start_text.as_ref() {
                completion = completion.start_text(text.clone());
            }

            let timer = Timer::new("completion");
            let mut output = self.output.take();
            if let Some(out) = output.as_mut() {
                completion = completion.out(out);
            }
            let result = self.complete(completion).await;
            self.output = output;
            let reply = result?;
            timer.debug(&self.chat_id);

            if !reply.has_tool_calls() {
                self.context.push(reply.clone());
                self.persist_tool_history().await?;
                return Ok(reply);
            }

            self.record(reply.clone());
            let executed = self.execute_tool_calls(&reply).await;
            // Saved before any tool or completion error propagates.
            self.persist_tool_history().await?;
            if executed? {
                log::debug!("[{}] A tool hook stopped the loop", self.chat_id);
                return Ok(reply);
            }
            last = Some(reply);
        }

        if self.config.raise_on_max_iterations {
            return Err(StateError::MaxIterations(max));
        }
        log::warn!(
            "[{}] Stopped after {} completions with tool calls pending",
            self.chat_id,
            max
        );
        last.ok_or(StateError::MaxIterations(max))
    }

    /// Execute `reply`'s tool calls in order. Returns `true` when a hook
    /// asked to stop.
    ///
    /// Every call ends up with exactly one tool message, including calls
    /// skipped because the loop stopped or a missing tool was raised.
    async fn execute_tool_calls(&mut self, reply: &Message) -> Result<bool> {
        for (index, call) in reply.tool_calls.iter().enumerate() {
            let name = call.name().to_string();

            let Some(tool) = self.tools.get(&name) else {
                log::warn!("[{}] Model called unregistered tool {}", self.chat_id, name);
                self.record(Message::tool(&call.id, format!("Tool {} is not registered.", name)));
                if self.config.raise_on_missing_tool {
                    self.skip_remaining(reply, index + 1);
                    return Err(StateError::MissingTool(name));
                }
                continue;
            };

            let mut extra = self.extra.clone();
            extra.insert("tool_call_index".to_string(), Value::from(index));

            let timer = Timer::new(format!("tool {}", name));
            let invocation = {
                let mut ctx = ToolContext {
                    call_id: call.id.clone(),
                    state: &mut *self,
                    extra,
                };
                tool.invoke(&call.function.arguments, &mut ctx).await
            };
            timer.debug(&self.chat_id);

            let message = match invocation.result {
                Some(Ok(output)) => {
                    for source in &output.sources {
                        self.sources.register(source.clone());
                    }
                    Message::tool(&call.id, output.content).with_sources(output.sources)
                }
                Some(Err(error)) => {
                    log::warn!("[{}] Tool {} failed: {}", self.chat_id, name, error);
                    Message::tool(&call.id, self.resolve_tool_error(error).await)
                }
                None => Message::tool(&call.id, format!("Tool {} was not run.", name)),
            };
            self.record(message);

            if invocation.stop {
                self.skip_remaining(reply, index + 1);
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn skip_remaining(&mut self, reply: &Message, from: usize) {
        let skipped = reply.tool_calls.get(from..).unwrap_or_default();
        if skipped.is_empty() {
            return;
        }
        log::debug!("[{}] Skipping {} remaining tool calls", self.chat_id, skipped.len());
        for call in skipped {
            self.record(Message::tool(&call.id, format!("Tool {} was skipped.", call.name())));
        }
    }

    /// Turn a tool failure into tool message text: the error's own handler,
    /// then the first matching registered handler, then `Error: {error}`.
    async fn resolve_tool_error(&mut self, error: StateError) -> String {
        if let StateError::SelfHandled(own) = &error {
            let own = Arc::clone(own);
            match own.handle(self).await {
                Ok(text) => return text,
                Err(e) => log::error!("[{}] Error handler failed: {}", self.chat_id, e),
            }
        }

        if let Some(handler) = self.handlers.find(&error) {
            match handler.handle(&error, self).await {
                Ok(text) => return text,
                Err(e) => log::error!("[{}] Error handler failed: {}", self.chat_id, e),
            }
        }

        default_tool_error(&error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ModuleConfig;
    use crate::error::{ErrorHandler, ErrorKind, SelfHandlingError};
    use crate::tools::{Fallback, HookSignal, Tool, ToolOutput};
    use async_trait::async_trait;
    use convo_core::{
        CharTokenizer, ChatEvent, DebugInfo, InMemoryMessageStore, MessageStore, Role, SourceRef,
        ToolCall, ToolHistoryEntry,
    };
    use convo_llm::{CompletionResponse, LanguageModelManager, ScriptedEndpoint};
    use schemars::JsonSchema;
    use serde::Deserialize;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use thiserror::Error;

    /// Add two integers.
    #[derive(Debug, Deserialize, JsonSchema)]
    struct SumArgs {
        x: i64,
        y: i64,
    }

    #[derive(Default)]
    struct Sum {
        runs: Arc<AtomicUsize>,
        fallbacks: Arc<AtomicUsize>,
        stop_after: bool,
        skip: bool,
        with_fallback: bool,
        stop_on_invalid: bool,
    }

    #[async_trait]
    impl Tool for Sum {
        type Args = SumArgs;

        fn name(&self) -> &str {
            "Sum"
        }

        fn description(&self) -> &str {
            "Add two integers."
        }

        async fn run(&self, args: SumArgs, _ctx: &mut ToolContext<'_>) -> Result<ToolOutput> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            Ok((args.x + args.y).to_string().into())
        }

        async fn pre_run_hook(&self, _args: &SumArgs, _ctx: &mut ToolContext<'_>) -> HookSignal {
            if self.skip {
                HookSignal::Stop
            } else {
                HookSignal::Continue
            }
        }

        async fn post_run_hook(
            &self,
            _output: Option<&ToolOutput>,
            _ctx: &mut ToolContext<'_>,
        ) -> HookSignal {
            if self.stop_after {
                HookSignal::Stop
            } else {
                HookSignal::Continue
            }
        }

        async fn on_validation_error(
            &self,
            _raw: &Value,
            _reason: &str,
            _ctx: &mut ToolContext<'_>,
        ) -> Option<Fallback> {
            if !self.with_fallback {
                return None;
            }
            self.fallbacks.fetch_add(1, Ordering::SeqCst);
            let fallback = Fallback::from(ToolOutput::text("Arguments must be two integers."));
            Some(if self.stop_on_invalid { fallback.stop() } else { fallback })
        }
    }

    /// Look a word up.
    #[derive(Debug, Deserialize, JsonSchema)]
    struct LookupArgs {
        word: String,
    }

    struct Lookup;

    #[async_trait]
    impl Tool for Lookup {
        type Args = LookupArgs;

        fn name(&self) -> &str {
            "Lookup"
        }

        fn description(&self) -> &str {
            "Look a word up."
        }

        async fn run(&self, args: LookupArgs, ctx: &mut ToolContext<'_>) -> Result<ToolOutput> {
            match args.word.as_str() {
                "self" => Err(StateError::SelfHandled(Arc::new(Recoverable))),
                "broken" => Err(StateError::tool("Lookup", "dictionary offline")),
                _ => {
                    let source = SourceRef::new("dict", format!("dict-{}", args.word), "Dictionary");
                    let index = ctx.call_index().unwrap_or_default();
                    Ok(ToolOutput::text(format!("{} is a word ({})", args.word, index))
                        .with_sources(vec![source]))
                }
            }
        }
    }

    #[derive(Debug, Error)]
    #[error("recoverable lookup failure")]
    struct Recoverable;

    #[async_trait]
    impl SelfHandlingError for Recoverable {
        async fn handle(&self, _state: &mut StateManager) -> Result<String> {
            Ok("recovered on its own".to_string())
        }
    }

    struct Fixed(&'static str);

    #[async_trait]
    impl ErrorHandler for Fixed {
        async fn handle(&self, _error: &StateError, _state: &mut StateManager) -> Result<String> {
            Ok(self.0.to_string())
        }
    }

    struct Failing;

    #[async_trait]
    impl ErrorHandler for Failing {
        async fn handle(&self, _error: &StateError, _state: &mut StateManager) -> Result<String> {
            Err(StateError::Configuration("handler misconfigured".to_string()))
        }
    }

    fn call(id: &str, name: &str, arguments: &str) -> CompletionResponse {
        CompletionResponse::tool_calls(vec![ToolCall::new(id, name, arguments)])
    }

    fn new_state(endpoint: Arc<ScriptedEndpoint>, config: ModuleConfig) -> StateManager {
        let llm = LanguageModelManager::new(endpoint, "gpt-4o").with_tokenizer(CharTokenizer::shared());
        let mut state = StateManager::new("chat", llm, config);
        state.append(Message::system("assistant"));
        state
    }

    fn tool_messages(state: &StateManager) -> Vec<String> {
        state
            .context()
            .iter()
            .filter(|m| m.role == Role::Tool)
            .map(|m| m.text().to_string())
            .collect()
    }

    #[tokio::test]
    async fn plain_answer_takes_one_completion() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![CompletionResponse::text("4")]));
        let mut state = new_state(endpoint.clone(), ModuleConfig::default());
        state.append(Message::user("2+2?"));

        let reply = state.run_loop().await.unwrap();
        assert_eq!(reply.role, Role::Assistant);
        assert!(!reply.has_tool_calls());
        assert_eq!(reply.text(), "4");
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(state.output().map(|m| m.text()), Some("4"));
    }

    #[tokio::test]
    async fn forced_sum_runs_then_answers() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            call("call_1", "Sum", r#"{"x": 2, "y": 3}"#),
            CompletionResponse::text("2 + 3 = 5"),
        ]));
        let mut state = new_state(endpoint.clone(), ModuleConfig::default());
        let sum = Sum::default();
        let runs = sum.runs.clone();
        state.register(sum);
        state.append(Message::user("sum 2 and 3"));

        let reply = state
            .run_loop_with(LoopOptions::new().tool_choice("Sum"))
            .await
            .unwrap();

        assert_eq!(reply.text(), "2 + 3 = 5");
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(tool_messages(&state), vec!["5".to_string()]);
        assert_eq!(endpoint.calls(), 2);

        let requests = endpoint.requests();
        assert_eq!(requests[0].tool_choice.as_deref(), Some("Sum"));
        assert_eq!(requests[1].tool_choice, None);
        let last = requests[1].messages.last().unwrap();
        assert_eq!(last.role, "tool");
        assert_eq!(last.tool_call_id.as_deref(), Some("call_1"));
    }

    #[tokio::test]
    async fn iteration_cap_bounds_completions() {
        for cap in 1..=3 {
            let endpoint = Arc::new(ScriptedEndpoint::new(
                (0..5).map(|i| call(&format!("call_{}", i), "Sum", r#"{"x": 1, "y": 1}"#)),
            ));
            let config = ModuleConfig {
                function_call_max_iterations: cap,
                ..ModuleConfig::default()
            };
            let mut state = new_state(endpoint.clone(), config);
            state.register(Sum::default());
            state.append(Message::user("keep adding"));

            let reply = state.run_loop().await.unwrap();
            assert!(reply.has_tool_calls());
            assert_eq!(endpoint.calls(), cap);
            assert_eq!(tool_messages(&state).len(), cap);
        }
    }

    #[tokio::test]
    async fn iteration_cap_can_raise() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            call("call_1", "Sum", r#"{"x": 1, "y": 1}"#),
            call("call_2", "Sum", r#"{"x": 1, "y": 1}"#),
        ]));
        let config = ModuleConfig {
            function_call_max_iterations: 2,
            raise_on_max_iterations: true,
            ..ModuleConfig::default()
        };
        let mut state = new_state(endpoint, config);
        state.register(Sum::default());
        state.append(Message::user("keep adding"));

        let err = state.run_loop().await.unwrap_err();
        assert!(matches!(err, StateError::MaxIterations(2)));
        assert_eq!(err.kind(), ErrorKind::MaxIterations);
    }

    #[tokio::test]
    async fn malformed_arguments_use_the_fallback_once() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            call("call_1", "Sum", r#"{"x": "two", "y": 3}"#),
            CompletionResponse::text("Sorry."),
        ]));
        let mut state = new_state(endpoint, ModuleConfig::default());
        let sum = Sum {
            with_fallback: true,
            ..Sum::default()
        };
        let (runs, fallbacks) = (sum.runs.clone(), sum.fallbacks.clone());
        state.register(sum);
        state.append(Message::user("sum two and 3"));

        state.run_loop().await.unwrap();
        assert_eq!(fallbacks.load(Ordering::SeqCst), 1);
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(tool_messages(&state), vec!["Arguments must be two integers.".to_string()]);
    }

    #[tokio::test]
    async fn malformed_arguments_without_fallback_report_the_error() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            call("call_1", "Sum", "not json"),
            CompletionResponse::text("Sorry."),
        ]));
        let mut state = new_state(endpoint, ModuleConfig::default());
        state.register(Sum::default());
        state.append(Message::user("sum"));

        state.run_loop().await.unwrap();
        let messages = tool_messages(&state);
        assert!(messages[0].starts_with("Error: Validation error: invalid arguments for Sum"));
    }

    #[tokio::test]
    async fn pre_hook_stop_skips_run_and_continues() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            call("call_1", "Sum", r#"{"x": 2, "y": 3}"#),
            CompletionResponse::text("Not allowed."),
        ]));
        let mut state = new_state(endpoint.clone(), ModuleConfig::default());
        let sum = Sum {
            skip: true,
            ..Sum::default()
        };
        let runs = sum.runs.clone();
        state.register(sum);
        state.append(Message::user("sum 2 and 3"));

        let reply = state.run_loop().await.unwrap();
        assert_eq!(reply.text(), "Not allowed.");
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert_eq!(tool_messages(&state), vec!["Tool Sum was not run.".to_string()]);
        assert_eq!(endpoint.calls(), 2);
    }

    #[tokio::test]
    async fn post_hook_stop_keeps_tool_messages_and_ends_the_loop() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            CompletionResponse::tool_calls(vec![
                ToolCall::new("call_1", "Sum", r#"{"x": 2, "y": 3}"#),
                ToolCall::new("call_2", "Sum", r#"{"x": 4, "y": 4}"#),
            ]),
            CompletionResponse::text("never requested"),
        ]));
        let mut state = new_state(endpoint.clone(), ModuleConfig::default());
        state.register(Sum {
            stop_after: true,
            ..Sum::default()
        });
        state.append(Message::user("sum twice"));

        let reply = state.run_loop().await.unwrap();
        assert!(reply.has_tool_calls());
        assert_eq!(
            tool_messages(&state),
            vec!["5".to_string(), "Tool Sum was skipped.".to_string()]
        );
        assert_eq!(endpoint.calls(), 1);
        assert_eq!(endpoint.remaining(), 1);
    }

    #[tokio::test]
    async fn fallback_stop_ends_the_loop() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            call("call_1", "Sum", r#"{"x": "two"}"#),
            CompletionResponse::text("never requested"),
        ]));
        let mut state = new_state(endpoint.clone(), ModuleConfig::default());
        state.register(Sum {
            with_fallback: true,
            stop_on_invalid: true,
            ..Sum::default()
        });
        state.append(Message::user("sum two"));

        let reply = state.run_loop().await.unwrap();
        assert!(reply.has_tool_calls());
        assert_eq!(tool_messages(&state), vec!["Arguments must be two integers.".to_string()]);
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn start_text_leads_every_streamed_completion() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            call("call_1", "Sum", r#"{"x": 2, "y": 3}"#),
            CompletionResponse::text("5"),
        ]));
        let mut state = new_state(endpoint, ModuleConfig::default());
        state.register(Sum::default());
        state.append(Message::user("sum 2 and 3"));

        let reply = state
            .run_loop_with(LoopOptions::new().start_text("Result: "))
            .await
            .unwrap();
        assert_eq!(reply.text(), "5");
        assert_eq!(state.output().map(|m| m.text()), Some("Result: 5"));
    }

    #[tokio::test]
    async fn missing_tool_gets_a_message_or_raises() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            call("call_1", "Weather", "{}"),
            CompletionResponse::text("I cannot check the weather."),
        ]));
        let mut state = new_state(endpoint, ModuleConfig::default());
        state.append(Message::user("weather?"));
        state.run_loop().await.unwrap();
        assert_eq!(tool_messages(&state), vec!["Tool Weather is not registered.".to_string()]);

        let endpoint = Arc::new(ScriptedEndpoint::new(vec![call("call_1", "Weather", "{}")]));
        let config = ModuleConfig {
            raise_on_missing_tool: true,
            ..ModuleConfig::default()
        };
        let mut state = new_state(endpoint, config);
        state.append(Message::user("weather?"));
        let err = state.run_loop().await.unwrap_err();
        assert!(matches!(err, StateError::MissingTool(name) if name == "Weather"));
    }

    #[tokio::test]
    async fn tool_errors_go_through_handlers_in_order() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            CompletionResponse::tool_calls(vec![
                ToolCall::new("call_1", "Lookup", r#"{"word": "self"}"#),
                ToolCall::new("call_2", "Lookup", r#"{"word": "broken"}"#),
            ]),
            CompletionResponse::text("done"),
        ]));
        let mut state = new_state(endpoint, ModuleConfig::default());
        state.register(Lookup);
        state.handlers_mut().on_kind(ErrorKind::Tool, Failing);
        state.handlers_mut().register(
            |e: &StateError| matches!(e, StateError::Tool { tool, .. } if tool == "Lookup"),
            Fixed("lookup handler"),
        );
        state.append(Message::user("look up"));

        state.run_loop().await.unwrap();
        assert_eq!(
            tool_messages(&state),
            vec![
                "recovered on its own".to_string(),
                // The failing handler matches first and falls back to the default.
                "Error: Tool Lookup failed: dictionary offline".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn first_matching_handler_wins() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            call("call_1", "Lookup", r#"{"word": "broken"}"#),
            CompletionResponse::text("done"),
        ]));
        let mut state = new_state(endpoint, ModuleConfig::default());
        state.register(Lookup);
        state.handlers_mut().register(
            |e: &StateError| matches!(e, StateError::Tool { tool, .. } if tool == "Lookup"),
            Fixed("specific"),
        );
        state.handlers_mut().on_kind(ErrorKind::Tool, Fixed("generic"));
        state.append(Message::user("look up"));

        state.run_loop().await.unwrap();
        assert_eq!(tool_messages(&state), vec!["specific".to_string()]);
    }

    #[tokio::test]
    async fn every_call_gets_one_tool_message_with_its_index() {
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            CompletionResponse::tool_calls(vec![
                ToolCall::new("call_1", "Lookup", r#"{"word": "alpha"}"#),
                ToolCall::new("call_2", "Missing", "{}"),
                ToolCall::new("call_3", "Lookup", r#"{"word": "beta"}"#),
            ]),
            CompletionResponse::text("done"),
        ]));
        let mut state = new_state(endpoint, ModuleConfig::default());
        state.register(Lookup);
        state.append(Message::user("look up"));

        state.run_loop().await.unwrap();
        let ids: Vec<String> = state
            .context()
            .iter()
            .filter_map(|m| m.tool_call_id.clone())
            .collect();
        assert_eq!(ids, vec!["call_1", "call_2", "call_3"]);
        assert_eq!(
            tool_messages(&state),
            vec![
                "alpha is a word (0)".to_string(),
                "Tool Missing is not registered.".to_string(),
                "beta is a word (2)".to_string(),
            ]
        );
        assert_eq!(state.sources().ordinal_of("dict", "dict-alpha"), Some(0));
        assert_eq!(state.sources().ordinal_of("dict", "dict-beta"), Some(1));
    }

    #[tokio::test]
    async fn tool_history_is_persisted_and_expanded_next_time() {
        let store = Arc::new(InMemoryMessageStore::new());
        let user = store
            .create("c1", Role::User, Some("sum 2 and 3"), DebugInfo::new())
            .await
            .unwrap();
        let assistant = store
            .create("c1", Role::Assistant, Some(""), DebugInfo::new())
            .await
            .unwrap();
        let event = ChatEvent {
            chat_id: "c1".to_string(),
            user_message_id: user.id.clone(),
            assistant_message_id: assistant.id.clone(),
            ..ChatEvent::default()
        };

        let endpoint = Arc::new(ScriptedEndpoint::new(vec![
            call("call_1", "Sum", r#"{"x": 2, "y": 3}"#),
            CompletionResponse::text("5"),
        ]));
        let llm = LanguageModelManager::new(endpoint, "gpt-4o").with_tokenizer(CharTokenizer::shared());
        let mut state = StateManager::load(&event, llm.clone(), ModuleConfig::default(), store.clone())
            .await
            .unwrap();
        state.register(Sum::default());
        state.run_loop().await.unwrap();

        let stored = store.list("c1").await.unwrap();
        let history: Vec<ToolHistoryEntry> = stored[0].debug.get_as(DebugInfo::TOOL_CALLS).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, Role::Assistant);
        assert_eq!(history[1].content.as_deref(), Some("5"));
        assert_eq!(stored[1].content.as_deref(), Some("5"));

        let reloaded = StateManager::load(&event, llm, ModuleConfig::default(), store)
            .await
            .unwrap();
        let roles: Vec<Role> = reloaded.context().iter().map(|m| m.role).collect();
        assert_eq!(roles, vec![Role::User, Role::Assistant, Role::Tool]);
    }

    async fn stored_chat(text: &str) -> (Arc<InMemoryMessageStore>, ChatEvent) {
        let store = Arc::new(InMemoryMessageStore::new());
        let user = store
            .create("c1", Role::User, Some(text), DebugInfo::new())
            .await
            .unwrap();
        let assistant = store
            .create("c1", Role::Assistant, Some(""), DebugInfo::new())
            .await
            .unwrap();
        let event = ChatEvent {
            chat_id: "c1".to_string(),
            user_message_id: user.id,
            assistant_message_id: assistant.id,
            ..ChatEvent::default()
        };
        (store, event)
    }

    /// Every call id of every assistant message has exactly one tool message.
    fn assert_calls_answered(context: &convo_core::MessageList) {
        let calls: Vec<String> = context
            .iter()
            .flat_map(|m| m.tool_calls.iter().map(|c| c.id.clone()))
            .collect();
        let answers: Vec<String> = context
            .iter()
            .filter(|m| m.role == Role::Tool)
            .filter_map(|m| m.tool_call_id.clone())
            .collect();
        assert!(!calls.is_empty());
        assert_eq!(calls, answers);
    }

    #[tokio::test]
    async fn stopped_calls_are_answered_after_reload() {
        let (store, event) = stored_chat("sum twice").await;
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![CompletionResponse::tool_calls(vec![
            ToolCall::new("call_1", "Sum", r#"{"x": 2, "y": 3}"#),
            ToolCall::new("call_2", "Sum", r#"{"x": 4, "y": 4}"#),
        ])]));
        let llm = LanguageModelManager::new(endpoint, "gpt-4o").with_tokenizer(CharTokenizer::shared());

        let mut state = StateManager::load(&event, llm.clone(), ModuleConfig::default(), store.clone())
            .await
            .unwrap();
        state.register(Sum {
            stop_after: true,
            ..Sum::default()
        });
        state.run_loop().await.unwrap();
        assert_calls_answered(state.context());

        let reloaded = StateManager::load(&event, llm, ModuleConfig::default(), store)
            .await
            .unwrap();
        assert_calls_answered(reloaded.context());
    }

    #[tokio::test]
    async fn executed_tools_are_persisted_when_a_later_completion_fails() {
        let (store, event) = stored_chat("sum 2 and 3").await;
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![call("call_1", "Sum", r#"{"x": 2, "y": 3}"#)]));
        let llm = LanguageModelManager::new(endpoint, "gpt-4o").with_tokenizer(CharTokenizer::shared());

        let mut state = StateManager::load(&event, llm, ModuleConfig::default(), store.clone())
            .await
            .unwrap();
        let sum = Sum::default();
        let runs = sum.runs.clone();
        state.register(sum);

        assert!(state.run_loop().await.is_err());
        assert_eq!(runs.load(Ordering::SeqCst), 1);

        let stored = store.list("c1").await.unwrap();
        let history: Vec<ToolHistoryEntry> = stored[0].debug.get_as(DebugInfo::TOOL_CALLS).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content.as_deref(), Some("5"));
    }

    #[tokio::test]
    async fn raised_missing_tool_still_answers_and_persists_every_call() {
        let (store, event) = stored_chat("sum and weather").await;
        let endpoint = Arc::new(ScriptedEndpoint::new(vec![CompletionResponse::tool_calls(vec![
            ToolCall::new("call_1", "Sum", r#"{"x": 2, "y": 3}"#),
            ToolCall::new("call_2", "Weather", "{}"),
            ToolCall::new("call_3", "Sum", r#"{"x": 1, "y": 1}"#),
        ])]));
        let llm = LanguageModelManager::new(endpoint, "gpt-4o").with_tokenizer(CharTokenizer::shared());
        let config = ModuleConfig {
            raise_on_missing_tool: true,
            ..ModuleConfig::default()
        };

        let mut state = StateManager::load(&event, llm.clone(), config.clone(), store.clone())
            .await
            .unwrap();
        let sum = Sum::default();
        let runs = sum.runs.clone();
        state.register(sum);

        let err = state.run_loop().await.unwrap_err();
        assert!(matches!(err, StateError::MissingTool(name) if name == "Weather"));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(
            tool_messages(&state),
            vec![
                "5".to_string(),
                "Tool Weather is not registered.".to_string(),
                "Tool Sum was skipped.".to_string(),
            ]
        );

        let reloaded = StateManager::load(&event, llm, config, store).await.unwrap();
        assert_calls_answered(reloaded.context());
    }
}

//! Event dispatch: load state, route to a module or command, report failures.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use convo_core::{ChatEvent, ContentSearch, DebugInfo, Message, MessageStore, Role};
use convo_llm::LanguageModelManager;
use serde_json::json;

use crate::config::ModuleConfig;
use crate::error::{ErrorHandler, ErrorHandlers, ErrorKind, Result, StateError};
use crate::state::StateManager;

/// Text written when a module finishes without producing an answer.
pub const EMPTY_ANSWER: &str = "Oops.";

/// A unit of conversational behaviour run against one request's state.
#[async_trait]
pub trait Module: Send + Sync {
    async fn run(&self, state: &mut StateManager) -> Result<()>;
}

pub struct App {
    module: Arc<dyn Module>,
    commands: HashMap<String, Arc<dyn Module>>,
    handlers: ErrorHandlers,
    config: ModuleConfig,
    llm: LanguageModelManager,
    store: Arc<dyn MessageStore>,
    search: Option<Arc<dyn ContentSearch>>,
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut commands: Vec<&String> = self.commands.keys().collect();
        commands.sort();
        f.debug_struct("App")
            .field("commands", &commands)
            .field("handlers", &self.handlers)
            .field("config", &self.config)
            .field("llm", &self.llm)
            .finish()
    }
}

impl App {
    pub fn new<M: Module + 'static>(
        module: M,
        llm: LanguageModelManager,
        store: Arc<dyn MessageStore>,
    ) -> Self {
        Self {
            module: Arc::new(module),
            commands: HashMap::new(),
            handlers: ErrorHandlers::new(),
            config: ModuleConfig::default(),
            llm,
            store,
            search: None,
        }
    }

    pub fn with_config(mut self, config: ModuleConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_search(mut self, search: Arc<dyn ContentSearch>) -> Self {
        self.search = Some(search);
        self
    }

    /// Run `module` for messages starting with `!name` or `/name`.
    pub fn command<M: Module + 'static>(mut self, name: impl Into<String>, module: M) -> Self {
        self.commands.insert(name.into(), Arc::new(module));
        self
    }

    /// Register a tool-error handler, consulted in registration order.
    pub fn on_error<F, H>(mut self, matcher: F, handler: H) -> Self
    where
        F: Fn(&StateError) -> bool + Send + Sync + 'static,
        H: ErrorHandler + 'static,
    {
        self.handlers.register(matcher, handler);
        self
    }

    pub fn on_kind<H: ErrorHandler + 'static>(mut self, kind: ErrorKind, handler: H) -> Self {
        self.handlers.on_kind(kind, handler);
        self
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    /// Answer one event and return the output message.
    ///
    /// Module failures never escape: they are recorded under `_debug` on
    /// the last user message and replaced by the configured failure text.
    /// Only failures to read the configuration or load the chat are
    /// returned.
    pub async fn handle(&self, event: &ChatEvent) -> Result<Message> {
        let config = self.config.with_overrides(&event.configuration)?;
        let llm = self
            .llm
            .using(config.llm_default_model.clone())
            .with_settings(config.llm_settings());

        let mut state = StateManager::load(event, llm, config.clone(), Arc::clone(&self.store))
            .await?
            .with_handlers(self.handlers.clone());
        if let Some(search) = self.search.as_ref() {
            state = state.with_search(Arc::clone(search));
        }
        state.ensure_output().await?;

        let module = self.route(&state, &config);
        match module.run(&mut state).await {
            Ok(()) => {
                if let Some(out) = state.output_mut() {
                    if out.text().trim().is_empty() {
                        out.update(EMPTY_ANSWER).await?;
                    }
                }
            }
            Err(error) => {
                log::error!("[{}] Module failed: {}", event.chat_id, error);
                report_failure(&mut state, &config, &error).await;
            }
        }

        state
            .output()
            .cloned()
            .ok_or_else(|| StateError::Storage("output message disappeared".to_string()))
    }

    fn route(&self, state: &StateManager, config: &ModuleConfig) -> Arc<dyn Module> {
        if !config.allow_commands {
            return Arc::clone(&self.module);
        }
        let command = state
            .last_user()
            .filter(|m| m.is_command)
            .and_then(|m| m.text().get(1..))
            .and_then(|rest| rest.split_whitespace().next());

        match command.and_then(|name| self.commands.get(name).map(|m| (name, m))) {
            Some((name, module)) => {
                log::debug!("[{}] Dispatching command {}", state.chat_id(), name);
                Arc::clone(module)
            }
            None => Arc::clone(&self.module),
        }
    }
}

async fn report_failure(state: &mut StateManager, config: &ModuleConfig, error: &StateError) {
    let chat_id = state.chat_id().to_string();
    let details = json!({
        "error": error.to_string(),
        "kind": error.kind().to_string(),
    });
    if let Some(user) = state.context_mut().last_where_mut(|m| m.role == Role::User) {
        if let Err(e) = user.set_debug(DebugInfo::DEBUG, details).await {
            log::error!("[{}] Could not record failure details: {}", chat_id, e);
        }
    }

    let text = config.failure_message(error);
    if let Some(out) = state.output_mut() {
        if let Err(e) = out.update(text).await {
            log::error!("[{}] Could not write failure message: {}", chat_id, e);
        }
    }
}

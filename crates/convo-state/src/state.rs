//! Per-request conversation state.
//!
//! A [`StateManager`] is built for one incoming event. It owns the context
//! sent to the model, the registered tools and the conversation's source
//! ordinals, and is dropped when the request ends. Nothing here outlives a
//! request: the next one rebuilds everything from the message store.

use std::fmt;
use std::sync::Arc;

use convo_core::{
    rereference, ChatEvent, ChunkList, ContentSearch, DebugInfo, FileList, Message, MessageList,
    MessageStore, Role, SourceRegistry, ToolHistoryEntry,
};
use convo_llm::{CompletionOptions, LanguageModelManager};
use serde_json::{Map, Value};

use crate::config::ModuleConfig;
use crate::error::{ErrorHandlers, Result, StateError};
use crate::files::FileQuery;
use crate::storage::Storage;
use crate::tools::{Tool, ToolRegistry};

#[derive(Clone)]
pub struct StateManager {
    pub(crate) chat_id: String,
    pub(crate) config: ModuleConfig,
    pub(crate) llm: LanguageModelManager,
    pub(crate) store: Option<Arc<dyn MessageStore>>,
    pub(crate) search: Option<Arc<dyn ContentSearch>>,
    pub(crate) history: MessageList,
    pub(crate) context: MessageList,
    pub(crate) tools: ToolRegistry,
    pub(crate) handlers: ErrorHandlers,
    pub(crate) sources: SourceRegistry,
    pub(crate) output: Option<Message>,
    pub(crate) extra: Map<String, Value>,
    pub(crate) tool_history: Vec<ToolHistoryEntry>,
}

impl fmt::Debug for StateManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StateManager")
            .field("chat_id", &self.chat_id)
            .field("model", &self.llm.model())
            .field("context", &self.context.len())
            .field("tools", &self.tools)
            .field("sources", &self.sources.len())
            .field("has_store", &self.store.is_some())
            .finish()
    }
}

impl StateManager {
    pub fn new(chat_id: impl Into<String>, llm: LanguageModelManager, config: ModuleConfig) -> Self {
        let tokenizer = llm.tokenizer().clone();
        Self {
            chat_id: chat_id.into(),
            config,
            llm,
            store: None,
            search: None,
            history: MessageList::new(tokenizer.clone()),
            context: MessageList::new(tokenizer),
            tools: ToolRegistry::new(),
            handlers: ErrorHandlers::new(),
            sources: SourceRegistry::new(),
            output: None,
            extra: Map::new(),
            tool_history: Vec::new(),
        }
    }

    pub fn with_store(mut self, store: Arc<dyn MessageStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_search(mut self, search: Arc<dyn ContentSearch>) -> Self {
        self.search = Some(search);
        self
    }

    pub fn with_handlers(mut self, handlers: ErrorHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    /// Set the message the final answer is written into.
    pub fn with_output(mut self, output: Message) -> Self {
        self.output = Some(output);
        self
    }

    /// Rebuild the state of `event`'s chat from the store.
    ///
    /// Tool exchanges persisted on earlier user messages are expanded back
    /// into history, source ordinals are recovered from their `_sources`
    /// snapshots, and the event's assistant placeholder becomes the output
    /// message rather than part of the context.
    pub async fn load(
        event: &ChatEvent,
        llm: LanguageModelManager,
        config: ModuleConfig,
        store: Arc<dyn MessageStore>,
    ) -> Result<Self> {
        let mut state = Self::new(event.chat_id.clone(), llm, config);
        let stored = store.list(&event.chat_id).await?;
        let messages: Vec<Message> = stored
            .into_iter()
            .map(|m| Message::from_stored(m, Some(Arc::clone(&store))))
            .collect();

        let history = MessageList::from_messages(messages, state.llm.tokenizer().clone()).expand();
        state.sources = SourceRegistry::from_history(&history);
        state.output = history
            .first_where(|m| m.id == event.assistant_message_id)
            .cloned();
        state.context = history.filter(|m| m.id != event.assistant_message_id);
        state.history = history;
        state.store = Some(store);

        log::debug!(
            "[{}] Loaded {} messages, {} known sources",
            state.chat_id,
            state.history.len(),
            state.sources.len()
        );
        Ok(state)
    }

    pub fn chat_id(&self) -> &str {
        &self.chat_id
    }

    pub fn config(&self) -> &ModuleConfig {
        &self.config
    }

    pub fn llm(&self) -> &LanguageModelManager {
        &self.llm
    }

    pub fn store(&self) -> Option<&Arc<dyn MessageStore>> {
        self.store.as_ref()
    }

    /// Everything loaded from the store, including the output placeholder.
    pub fn history(&self) -> &MessageList {
        &self.history
    }

    pub fn context(&self) -> &MessageList {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut MessageList {
        &mut self.context
    }

    pub fn append(&mut self, message: Message) {
        self.context.push(message);
    }

    pub fn prepend(&mut self, message: Message) {
        self.context.insert(0, message);
    }

    /// Restore the context to loaded history.
    pub fn reset(&mut self) {
        let output_id = self.output.as_ref().map(|m| m.id.clone());
        self.context = self
            .history
            .filter(|m| output_id.as_deref() != Some(m.id.as_str()));
    }

    pub fn clear(&mut self) {
        self.context.clear();
    }

    pub fn last_user(&self) -> Option<&Message> {
        self.context.last_where(|m| m.role == Role::User)
    }

    pub fn last_assistant(&self) -> Option<&Message> {
        self.context.last_where(|m| m.role == Role::Assistant)
    }

    pub fn register<T: Tool>(&mut self, tool: T) -> bool {
        self.tools.register(tool)
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    pub fn handlers(&self) -> &ErrorHandlers {
        &self.handlers
    }

    pub fn handlers_mut(&mut self) -> &mut ErrorHandlers {
        &mut self.handlers
    }

    /// Values handed to every tool call alongside `tool_call_index`.
    pub fn extra(&self) -> &Map<String, Value> {
        &self.extra
    }

    pub fn set_extra(&mut self, key: impl Into<String>, value: Value) {
        self.extra.insert(key.into(), value);
    }

    pub fn output(&self) -> Option<&Message> {
        self.output.as_ref()
    }

    pub fn output_mut(&mut self) -> Option<&mut Message> {
        self.output.as_mut()
    }

    pub fn sources(&self) -> &SourceRegistry {
        &self.sources
    }

    pub fn sources_mut(&mut self) -> &mut SourceRegistry {
        &mut self.sources
    }

    /// Append `files` as a system message numbered by conversation ordinal.
    pub fn add_files(&mut self, files: &FileList) {
        let message = files.as_message(&mut self.sources);
        self.context.push(message);
    }

    pub fn add_chunks(&mut self, chunks: &ChunkList) {
        let message = chunks.as_message(&mut self.sources, Role::System);
        self.context.push(message);
    }

    /// Key-value storage on the first user message.
    pub fn storage(&mut self) -> Storage<'_> {
        Storage::new(&mut self.history, &mut self.context)
    }

    /// Query builder over the configured content search.
    pub fn files(&self) -> Result<FileQuery> {
        let search = self.search.as_ref().ok_or_else(|| {
            StateError::Configuration("no content search configured".to_string())
        })?;
        Ok(FileQuery::new(Arc::clone(search), self.llm.tokenizer().clone()))
    }

    /// A copy bound to another model.
    pub fn using(&self, model: impl Into<String>) -> Self {
        let mut fork = self.fork();
        fork.llm = self.llm.using(model);
        fork
    }

    /// Independent copy for nested work. Context, tools and sources are
    /// copied; the store and search handles are shared.
    pub fn fork(&self) -> Self {
        let mut fork = self.clone();
        fork.tool_history.clear();
        fork
    }

    /// One completion over the current context.
    ///
    /// `<sourceN>` tags are renumbered to conversation ordinals first, and
    /// every source known to the conversation is passed along for citation
    /// rewriting.
    pub async fn complete(&mut self, options: CompletionOptions<'_>) -> Result<Message> {
        let mut options = options;
        for source in std::mem::take(&mut options.search_context) {
            self.sources.register(source);
        }
        let context = rereference(&self.context, &mut self.sources);
        options.search_context = self.sources.sources().to_vec();
        Ok(self.llm.complete(context, options).await?)
    }

    /// Stream a completion into a fresh assistant message, which is created
    /// in the store when one is configured, and append the reply.
    pub async fn stream(&mut self) -> Result<Message> {
        self.stream_starting_with("").await
    }

    /// [`stream`](Self::stream) with `start_text` leading the new message.
    pub async fn stream_starting_with(&mut self, start_text: &str) -> Result<Message> {
        let mut out = self.new_assistant_message().await?;
        let options = CompletionOptions::new().out(&mut out).start_text(start_text);
        let reply = self.complete(options).await?;
        self.context.push(reply);
        Ok(out)
    }

    pub(crate) async fn new_assistant_message(&self) -> Result<Message> {
        match self.store.as_ref() {
            Some(store) => {
                let stored = store
                    .create(&self.chat_id, Role::Assistant, Some(""), DebugInfo::new())
                    .await?;
                Ok(Message::from_stored(stored, Some(Arc::clone(store))))
            }
            None => Ok(Message::assistant("")),
        }
    }

    pub(crate) async fn ensure_output(&mut self) -> Result<()> {
        if self.output.is_none() {
            self.output = Some(self.new_assistant_message().await?);
        }
        Ok(())
    }

    /// Append to the context and to the tool history saved at the end of
    /// the loop.
    pub(crate) fn record(&mut self, message: Message) {
        self.tool_history.push(ToolHistoryEntry::from(&message));
        self.context.push(message);
    }

    /// Save the loop's tool exchanges and the source snapshot on the last
    /// stored user message, so the next request can expand them.
    pub async fn persist_tool_history(&mut self) -> Result<()> {
        if self.tool_history.is_empty() {
            return Ok(());
        }
        let entries = std::mem::take(&mut self.tool_history);
        let chat_id = self.chat_id.clone();
        let sources = self.sources.clone();

        let Some(target) = self
            .context
            .last_where_mut(|m| m.role == Role::User && m.is_remote())
        else {
            log::debug!(
                "[{}] No stored user message, {} tool messages not persisted",
                chat_id,
                entries.len()
            );
            return Ok(());
        };

        let mut persisted: Vec<ToolHistoryEntry> = target
            .debug
            .get_as(DebugInfo::TOOL_CALLS)
            .unwrap_or_default();
        persisted.extend(entries);
        target.debug.set_as(DebugInfo::TOOL_CALLS, &persisted)?;
        sources.save_to(&mut target.debug)?;
        target.push().await?;

        log::debug!(
            "[{}] Persisted {} tool messages on {}",
            chat_id,
            persisted.len(),
            target.id
        );
        Ok(())
    }
}

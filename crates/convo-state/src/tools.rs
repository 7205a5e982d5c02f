//! Typed tools, their hooks, and the per-state registry.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use convo_core::{schema_for, SourceRef, ToolSchema};
use dashmap::{mapref::entry::Entry, DashMap};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::error::{Result, StateError};
use crate::state::StateManager;

/// Returned by hooks to let a call proceed or stop it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HookSignal {
    #[default]
    Continue,
    Stop,
}

/// Text a tool hands back, plus any sources it drew from.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ToolOutput {
    pub content: String,
    pub sources: Vec<SourceRef>,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            sources: Vec::new(),
        }
    }

    pub fn with_sources(mut self, sources: Vec<SourceRef>) -> Self {
        self.sources = sources;
        self
    }
}

impl From<String> for ToolOutput {
    fn from(content: String) -> Self {
        Self::text(content)
    }
}

impl From<&str> for ToolOutput {
    fn from(content: &str) -> Self {
        Self::text(content)
    }
}

/// Replacement outcome for a call whose arguments did not validate.
#[derive(Debug)]
pub struct Fallback {
    pub result: Result<ToolOutput>,
    /// `Stop` ends the loop after this call.
    pub signal: HookSignal,
}

impl Fallback {
    pub fn new(result: Result<ToolOutput>) -> Self {
        Self {
            result,
            signal: HookSignal::Continue,
        }
    }

    pub fn stop(mut self) -> Self {
        self.signal = HookSignal::Stop;
        self
    }
}

impl From<ToolOutput> for Fallback {
    fn from(output: ToolOutput) -> Self {
        Self::new(Ok(output))
    }
}

/// What a running tool can see: its call id, the owning state and the
/// per-request extras (`tool_call_index` among them).
pub struct ToolContext<'a> {
    pub call_id: String,
    pub state: &'a mut StateManager,
    pub extra: Map<String, Value>,
}

impl fmt::Debug for ToolContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolContext")
            .field("call_id", &self.call_id)
            .field("extra", &self.extra)
            .finish()
    }
}

impl ToolContext<'_> {
    /// Position of this call within the completion that emitted it.
    pub fn call_index(&self) -> Option<usize> {
        self.extra
            .get("tool_call_index")
            .and_then(Value::as_u64)
            .map(|i| i as usize)
    }
}

/// A tool the model may call.
///
/// The argument type doubles as the schema offered to the model, so a tool
/// is declared once:
///
/// ```ignore
/// /// Add two integers.
/// #[derive(Deserialize, JsonSchema)]
/// struct SumArgs { x: i64, y: i64 }
///
/// struct Sum;
///
/// #[async_trait]
/// impl Tool for Sum {
///     type Args = SumArgs;
///     fn name(&self) -> &str { "Sum" }
///     fn description(&self) -> &str { "Add two integers." }
///     async fn run(&self, args: SumArgs, _ctx: &mut ToolContext<'_>) -> Result<ToolOutput> {
///         Ok((args.x + args.y).to_string().into())
///     }
/// }
/// ```
#[async_trait]
pub trait Tool: Send + Sync + 'static {
    type Args: DeserializeOwned + JsonSchema + Send + Sync;

    fn name(&self) -> &str;

    fn description(&self) -> &str;

    fn schema(&self) -> ToolSchema {
        ToolSchema::new(self.name(), self.description(), schema_for::<Self::Args>())
    }

    async fn run(&self, args: Self::Args, ctx: &mut ToolContext<'_>) -> Result<ToolOutput>;

    /// `Stop` skips `run`; `post_run_hook` is still called.
    async fn pre_run_hook(&self, _args: &Self::Args, _ctx: &mut ToolContext<'_>) -> HookSignal {
        HookSignal::Continue
    }

    /// `Stop` ends the loop after this call. `output` is `None` when `run`
    /// was skipped or failed.
    async fn post_run_hook(
        &self,
        _output: Option<&ToolOutput>,
        _ctx: &mut ToolContext<'_>,
    ) -> HookSignal {
        HookSignal::Continue
    }

    /// Fallback for arguments that do not match `Args`. Called instead of
    /// `run` and both hooks; `None` turns the mismatch into a validation
    /// error.
    async fn on_validation_error(
        &self,
        _raw: &Value,
        _reason: &str,
        _ctx: &mut ToolContext<'_>,
    ) -> Option<Fallback> {
        None
    }
}

/// Outcome of one call. `result` is `None` when a pre-run hook skipped `run`.
#[derive(Debug)]
pub struct Invocation {
    pub result: Option<Result<ToolOutput>>,
    pub stop: bool,
}

#[async_trait]
pub trait DynTool: Send + Sync {
    fn name(&self) -> &str;

    fn schema(&self) -> ToolSchema;

    async fn invoke(&self, arguments: &str, ctx: &mut ToolContext<'_>) -> Invocation;
}

struct Typed<T>(T);

#[async_trait]
impl<T: Tool> DynTool for Typed<T> {
    fn name(&self) -> &str {
        self.0.name()
    }

    fn schema(&self) -> ToolSchema {
        self.0.schema()
    }

    async fn invoke(&self, arguments: &str, ctx: &mut ToolContext<'_>) -> Invocation {
        let raw = if arguments.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
        };

        let args = match serde_json::from_value::<T::Args>(raw.clone()) {
            Ok(args) => args,
            Err(e) => {
                let reason = e.to_string();
                log::debug!("Arguments for {} rejected: {}", self.0.name(), reason);
                let fallback = self
                    .0
                    .on_validation_error(&raw, &reason, ctx)
                    .await
                    .unwrap_or_else(|| {
                        Fallback::new(Err(StateError::Validation(format!(
                            "invalid arguments for {}: {}",
                            self.0.name(),
                            reason
                        ))))
                    });
                return Invocation {
                    result: Some(fallback.result),
                    stop: fallback.signal == HookSignal::Stop,
                };
            }
        };

        let result = match self.0.pre_run_hook(&args, ctx).await {
            HookSignal::Stop => {
                log::debug!("Pre-run hook of {} skipped the call", self.0.name());
                None
            }
            HookSignal::Continue => Some(self.0.run(args, ctx).await),
        };

        let output = result.as_ref().and_then(|r| r.as_ref().ok());
        let stop = self.0.post_run_hook(output, ctx).await == HookSignal::Stop;
        Invocation { result, stop }
    }
}

pub type SharedTool = Arc<dyn DynTool>;

/// Tools registered on one state. Cloning copies the map, so a fork can
/// register more tools without touching its parent.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: DashMap<String, SharedTool>,
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolRegistry")
            .field("tools", &self.names())
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `tool`. Returns `false`, leaving the first registration in place,
    /// when the name is empty or already taken.
    pub fn register<T: Tool>(&self, tool: T) -> bool {
        self.register_shared(Arc::new(Typed(tool)))
    }

    pub fn register_shared(&self, tool: SharedTool) -> bool {
        let name = tool.name().trim();
        if name.is_empty() {
            log::warn!("Skipping tool with an empty name");
            return false;
        }

        match self.tools.entry(name.to_string()) {
            Entry::Occupied(_) => {
                log::warn!("Tool {} is already registered, skipping", name);
                false
            }
            Entry::Vacant(entry) => {
                entry.insert(tool);
                true
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<SharedTool> {
        self.tools.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Provider schemas, sorted by name.
    pub fn schemas(&self) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .iter()
            .map(|entry| entry.value().schema())
            .collect();
        schemas.sort_by(|left, right| left.function.name.cmp(&right.function.name));
        schemas
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tools.iter().map(|entry| entry.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

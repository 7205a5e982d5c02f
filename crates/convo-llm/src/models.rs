//! Model registry: context windows, output limits and role conventions.
//!
//! Built-in entries cover common models; user entries (registered at runtime
//! or loaded from `model_limits.json`) take priority.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// `(name, input tokens, output tokens, canonical provider, developer role)`
pub const KNOWN_MODELS: &[(&str, u32, u32, &str, bool)] = &[
    ("gpt-4o", 128_000, 16_384, "openai", false),
    ("gpt-4o-mini", 128_000, 16_384, "openai", false),
    ("gpt-4-turbo", 128_000, 4_096, "openai", false),
    ("gpt-4", 8_192, 4_096, "openai", false),
    ("gpt-4.1", 1_047_576, 32_768, "openai", false),
    ("gpt-4.1-mini", 1_047_576, 32_768, "openai", false),
    ("gpt-3.5-turbo", 16_385, 4_096, "openai", false),
    ("o1", 200_000, 100_000, "openai", true),
    ("o3-mini", 200_000, 100_000, "openai", true),
    ("o4-mini", 200_000, 100_000, "openai", true),
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSpec {
    /// Identifier, also used as a prefix for dated variants.
    pub name: String,
    pub input_limit: u32,
    pub output_limit: u32,
    /// Name sent to the provider.
    #[serde(default)]
    pub canonical: Option<String>,
    /// Provider that serves the model, e.g. `openai`.
    #[serde(default)]
    pub provider: Option<String>,
    /// Send system messages with the `developer` role.
    #[serde(default)]
    pub developer_role: bool,
}

impl ModelSpec {
    pub fn new(name: impl Into<String>, input_limit: u32, output_limit: u32) -> Self {
        Self {
            name: name.into(),
            input_limit,
            output_limit,
            canonical: None,
            provider: None,
            developer_role: false,
        }
    }

    pub fn with_canonical(mut self, canonical: impl Into<String>) -> Self {
        self.canonical = Some(canonical.into());
        self
    }

    pub fn with_provider(mut self, provider: impl Into<String>) -> Self {
        self.provider = Some(provider.into());
        self
    }

    pub fn with_developer_role(mut self, developer_role: bool) -> Self {
        self.developer_role = developer_role;
        self
    }

    /// The model id to put on the wire.
    pub fn wire_name(&self) -> &str {
        self.canonical.as_deref().unwrap_or(&self.name)
    }

    /// Tokens left for the prompt once output is reserved.
    pub fn prompt_budget(&self) -> u32 {
        self.input_limit.saturating_sub(self.output_limit)
    }
}

fn builtin(name: &str) -> Option<ModelSpec> {
    KNOWN_MODELS
        .iter()
        .find(|(n, ..)| *n == name)
        .map(|(n, input, output, provider, developer)| {
            ModelSpec::new(*n, *input, *output)
                .with_provider(*provider)
                .with_developer_role(*developer)
        })
}

#[derive(Debug, Clone, Default)]
pub struct ModelRegistry {
    user_models: HashMap<String, ModelSpec>,
    config_path: Option<PathBuf>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config_path(path: impl Into<PathBuf>) -> Self {
        Self {
            user_models: HashMap::new(),
            config_path: Some(path.into()),
        }
    }

    /// Add or override an entry.
    pub fn register(&mut self, spec: ModelSpec) {
        self.user_models.insert(spec.name.clone(), spec);
    }

    /// Exact match first, then the longest registered name that prefixes
    /// `model` (so `gpt-4o-2024-08-06` resolves to `gpt-4o`).
    pub fn get(&self, model: &str) -> Option<ModelSpec> {
        if let Some(spec) = self.user_models.get(model) {
            return Some(spec.clone());
        }
        if let Some(spec) = builtin(model) {
            return Some(spec);
        }

        let user_match = self
            .user_models
            .values()
            .filter(|s| model.starts_with(&s.name))
            .max_by_key(|s| s.name.len())
            .cloned();
        if user_match.is_some() {
            return user_match;
        }

        KNOWN_MODELS
            .iter()
            .filter(|(name, ..)| model.starts_with(name))
            .max_by_key(|(name, ..)| name.len())
            .and_then(|(name, ..)| builtin(name))
    }

    pub fn contains(&self, model: &str) -> bool {
        self.get(model).is_some()
    }

    /// Every known name, user entries included, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = KNOWN_MODELS.iter().map(|(n, ..)| n.to_string()).collect();
        names.extend(self.user_models.keys().cloned());
        names.sort();
        names.dedup();
        names
    }

    /// Load user entries from the configuration file, if it exists.
    ///
    /// Default path: `<config dir>/convo/model_limits.json`
    pub async fn load_user_config(&mut self) -> std::io::Result<usize> {
        let path = self.config_path.clone().unwrap_or_else(default_config_path);
        if !path.exists() {
            return Ok(0);
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let specs: Vec<ModelSpec> = serde_json::from_str(&content)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        let count = specs.len();
        for spec in specs {
            self.register(spec);
        }

        log::info!("Loaded {} user models from {:?}", count, path);
        Ok(count)
    }

    pub async fn save_user_config(&self) -> std::io::Result<()> {
        let path = self.config_path.clone().unwrap_or_else(default_config_path);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut specs: Vec<&ModelSpec> = self.user_models.values().collect();
        specs.sort_by(|a, b| a.name.cmp(&b.name));
        let content = serde_json::to_string_pretty(&specs)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e.to_string()))?;
        tokio::fs::write(&path, content).await
    }
}

fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("convo")
        .join("model_limits.json")
}

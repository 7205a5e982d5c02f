use std::path::{Path, PathBuf};
use std::time::Duration;

use convo_core::KeepOptions;
use convo_llm::LlmSettings;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{Result, StateError};

pub const DEFAULT_FAILURE_MESSAGE: &str =
    "Sorry, something went wrong while answering. Please try again.";

/// Configuration for a module run.
///
/// Every field has a default, so partial files and per-event override maps
/// are accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    pub context_window_min_messages: usize,
    pub context_window_max_messages: usize,
    /// Insert a system notice when history was cut.
    pub context_truncation_notice: bool,
    pub function_call_max_iterations: usize,
    pub raise_on_missing_tool: bool,
    pub raise_on_max_iterations: bool,
    pub llm_default_model: String,
    pub llm_temperature: f32,
    pub llm_seed: Option<u64>,
    pub llm_timeout_ms: u64,
    pub llm_allow_streaming: bool,
    /// Route `!name` / `/name` messages to registered commands.
    pub allow_commands: bool,
    pub on_failure: String,
    pub on_failure_message_override: Option<String>,
    pub on_failure_display_error: bool,
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            context_window_min_messages: 2,
            context_window_max_messages: 10,
            context_truncation_notice: true,
            function_call_max_iterations: 5,
            raise_on_missing_tool: false,
            raise_on_max_iterations: false,
            llm_default_model: "gpt-4o".to_string(),
            llm_temperature: 0.0,
            llm_seed: None,
            llm_timeout_ms: 60_000,
            llm_allow_streaming: true,
            allow_commands: true,
            on_failure: DEFAULT_FAILURE_MESSAGE.to_string(),
            on_failure_message_override: None,
            on_failure_display_error: false,
        }
    }
}

impl ModuleConfig {
    /// `<config dir>/convo`
    pub fn default_dir() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("convo")
    }

    /// Load from `path`, or from `config.toml` / `config.json` in the
    /// default directory. Missing files yield the defaults.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let dir = Self::default_dir();
                let toml_path = dir.join("config.toml");
                if toml_path.exists() {
                    toml_path
                } else {
                    dir.join("config.json")
                }
            }
        };

        if !path.exists() {
            log::debug!("No config at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path).await?;
        let config = if path.extension().and_then(|e| e.to_str()) == Some("toml") {
            toml::from_str(&content)
                .map_err(|e| StateError::Configuration(format!("{}: {}", path.display(), e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| StateError::Configuration(format!("{}: {}", path.display(), e)))?
        };
        log::info!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Copy with the keys of `overrides` replacing this config's values.
    pub fn with_overrides(&self, overrides: &Map<String, Value>) -> Result<Self> {
        if overrides.is_empty() {
            return Ok(self.clone());
        }
        let mut merged = serde_json::to_value(self)?;
        if let Value::Object(fields) = &mut merged {
            for (key, value) in overrides {
                if !fields.contains_key(key) {
                    log::warn!("Ignoring unknown config override {}", key);
                    continue;
                }
                fields.insert(key.clone(), value.clone());
            }
        }
        serde_json::from_value(merged)
            .map_err(|e| StateError::Configuration(format!("invalid override: {}", e)))
    }

    pub fn keep_options(&self) -> KeepOptions {
        let options = KeepOptions::new(
            self.context_window_min_messages,
            Some(self.context_window_max_messages),
        );
        if self.context_truncation_notice {
            options.with_notice(KeepOptions::DEFAULT_NOTICE)
        } else {
            options
        }
    }

    pub fn llm_settings(&self) -> LlmSettings {
        LlmSettings {
            temperature: Some(self.llm_temperature),
            seed: self.llm_seed,
            timeout: Duration::from_millis(self.llm_timeout_ms),
            allow_streaming: self.llm_allow_streaming,
            keep: self.keep_options(),
        }
    }

    /// What the user sees when a request fails.
    pub fn failure_message(&self, error: &StateError) -> String {
        let base = self
            .on_failure_message_override
            .as_deref()
            .unwrap_or(&self.on_failure);
        if self.on_failure_display_error {
            format!("{}\n\n```\n{}\n```", base, error)
        } else {
            base.to_string()
        }
    }
}

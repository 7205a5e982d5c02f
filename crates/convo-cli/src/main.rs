use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use colored::Colorize;
use convo_core::{ChatEvent, DebugInfo, InMemoryMessageStore, Message, MessageStore, Role};
use convo_llm::providers::openai::DEFAULT_BASE_URL;
use convo_llm::{LanguageModelManager, ModelRegistry, OpenAiEndpoint};
use convo_state::{init_logging, App, Module, ModuleConfig, StateManager, Tool, ToolContext, ToolOutput};
use schemars::JsonSchema;
use serde::Deserialize;

#[derive(Parser)]
#[command(name = "convo")]
#[command(about = "Ask a question through the convo tool loop")]
#[command(version)]
struct Cli {
    /// Module config file (TOML or JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, short, global = true, default_value = "false")]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask one question and print the answer
    Ask {
        question: String,

        /// Model to answer with, overriding the config
        #[arg(long)]
        model: Option<String>,

        #[arg(long, default_value = DEFAULT_BASE_URL)]
        base_url: String,

        #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
        api_key: Option<String>,
    },
    /// List known models and their limits
    Models,
}

/// Add two integers.
#[derive(Debug, Deserialize, JsonSchema)]
struct SumArgs {
    x: i64,
    y: i64,
}

struct Sum;

#[async_trait]
impl Tool for Sum {
    type Args = SumArgs;

    fn name(&self) -> &str {
        "Sum"
    }

    fn description(&self) -> &str {
        "Add two integers."
    }

    async fn run(&self, args: SumArgs, _ctx: &mut ToolContext<'_>) -> convo_state::Result<ToolOutput> {
        let total = args
            .x
            .checked_add(args.y)
            .ok_or_else(|| convo_state::StateError::tool("Sum", "overflow"))?;
        Ok(total.to_string().into())
    }
}

struct Assistant;

#[async_trait]
impl Module for Assistant {
    async fn run(&self, state: &mut StateManager) -> convo_state::Result<()> {
        state.prepend(Message::system(
            "You are a concise assistant. Use the Sum tool for arithmetic.",
        ));
        state.register(Sum);
        state.run_loop().await?;
        Ok(())
    }
}

async fn load_registry() -> ModelRegistry {
    let mut registry = ModelRegistry::new();
    match registry.load_user_config().await {
        Ok(0) => {}
        Ok(count) => log::info!("Loaded {} model overrides", count),
        Err(e) => log::warn!("Could not read model overrides: {}", e),
    }
    registry
}

async fn ask(
    config: ModuleConfig,
    question: String,
    base_url: String,
    api_key: Option<String>,
) -> Result<()> {
    let Some(api_key) = api_key else {
        bail!("no API key: pass --api-key or set OPENAI_API_KEY");
    };

    let endpoint = OpenAiEndpoint::new(api_key).with_base_url(base_url);
    let llm = LanguageModelManager::new(Arc::new(endpoint), config.llm_default_model.clone())
        .with_registry(load_registry().await);

    let store = Arc::new(InMemoryMessageStore::new());
    let chat_id = "cli";
    let user = store
        .create(chat_id, Role::User, Some(question.as_str()), DebugInfo::new())
        .await?;
    let assistant = store
        .create(chat_id, Role::Assistant, Some(""), DebugInfo::new())
        .await?;
    let event = ChatEvent {
        chat_id: chat_id.to_string(),
        user_message_id: user.id,
        assistant_message_id: assistant.id,
        user_message_text: question,
        ..ChatEvent::default()
    };

    let app = App::new(Assistant, llm, store.clone()).with_config(config);
    let answer = app.handle(&event).await?;
    println!("{}", answer.text());

    let tool_calls = store
        .list(chat_id)
        .await?
        .iter()
        .filter_map(|m| m.debug.get(DebugInfo::TOOL_CALLS))
        .filter_map(|v| v.as_array().map(Vec::len))
        .sum::<usize>();
    if tool_calls > 0 {
        eprintln!("{}", format!("({} tool messages)", tool_calls).dimmed());
    }
    Ok(())
}

async fn models() -> Result<()> {
    let registry = load_registry().await;
    for name in registry.names() {
        let Some(spec) = registry.get(&name) else {
            continue;
        };
        let developer = if spec.developer_role { " developer-role" } else { "" };
        println!(
            "{:<16} in {:>7}  out {:>6}{}",
            name.bold(),
            spec.input_limit,
            spec.output_limit,
            developer.cyan()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    match cli.command {
        Commands::Ask {
            question,
            model,
            base_url,
            api_key,
        } => {
            let mut config = ModuleConfig::load(cli.config.as_deref())
                .await
                .context("loading config")?;
            if let Some(model) = model {
                config.llm_default_model = model;
            }
            ask(config, question, base_url, api_key).await
        }
        Commands::Models => models().await,
    }
}

//! Structured extraction through a single forced tool call.
//!
//! ```ignore
//! let invoice: Invoice = llm
//!     .parser()
//!     .into::<Invoice>()
//!     .following("Amounts are in cents.")
//!     .asserting(|i| i.total >= 0, "total cannot be negative")
//!     .parse("Invoice #12 for $4.20")
//!     .await?;
//! ```
//!
//! Every configuration call returns a new value; only `parse` talks to the
//! model.

use std::marker::PhantomData;
use std::sync::Arc;

use convo_core::{schema_for, Message, ToolSchema};
use schemars::JsonSchema;
use serde::de::DeserializeOwned;

use crate::manager::{CompletionOptions, LanguageModelManager};
use crate::provider::{LlmError, Result};

type Check<T> = Arc<dyn Fn(&T) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct ParserBuilder<'a> {
    llm: &'a LanguageModelManager,
    instructions: Vec<String>,
}

impl<'a> ParserBuilder<'a> {
    pub(crate) fn new(llm: &'a LanguageModelManager) -> Self {
        Self {
            llm,
            instructions: Vec::new(),
        }
    }

    pub fn following(&self, instructions: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.instructions.push(instructions.into());
        next
    }

    /// Bind the output type.
    #[allow(clippy::should_implement_trait)]
    pub fn into<T>(&self) -> Parser<'a, T>
    where
        T: DeserializeOwned + JsonSchema,
    {
        Parser {
            llm: self.llm,
            instructions: self.instructions.clone(),
            assertions: Vec::new(),
            _marker: PhantomData,
        }
    }
}

pub struct Parser<'a, T> {
    llm: &'a LanguageModelManager,
    instructions: Vec<String>,
    assertions: Vec<(Check<T>, String)>,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T> Clone for Parser<'a, T> {
    fn clone(&self) -> Self {
        Self {
            llm: self.llm,
            instructions: self.instructions.clone(),
            assertions: self.assertions.clone(),
            _marker: PhantomData,
        }
    }
}

impl<'a, T> Parser<'a, T>
where
    T: DeserializeOwned + JsonSchema,
{
    pub fn following(&self, instructions: impl Into<String>) -> Self {
        let mut next = self.clone();
        next.instructions.push(instructions.into());
        next
    }

    /// Fail with `message` when `check` rejects the parsed value.
    pub fn asserting<F>(&self, check: F, message: impl Into<String>) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        let mut next = self.clone();
        next.assertions.push((Arc::new(check), message.into()));
        next
    }

    fn tool(&self) -> ToolSchema {
        let name = T::schema_name().to_string();
        let parameters = schema_for::<T>();
        let description = parameters
            .get("description")
            .and_then(|d| d.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| format!("Record the extracted {}.", name));
        ToolSchema::new(name, description, parameters)
    }

    pub async fn parse(&self, query: &str) -> Result<T> {
        let tool = self.tool();
        let name = tool.name().to_string();

        let mut system = self.instructions.join("\n\n");
        if !system.is_empty() {
            system.push_str("\n\n");
        }
        system.push_str(&format!("Call the {} tool with the data found in the user's message.", name));

        let messages = vec![Message::system(system), Message::user(query)];
        let options = CompletionOptions::new().tools(vec![tool]).tool_choice(name.clone());
        let reply = self.llm.complete(messages, options).await?;

        let call = reply
            .tool_calls
            .iter()
            .find(|c| c.name() == name)
            .ok_or_else(|| LlmError::Parse(format!("model did not call {}", name)))?;
        let arguments = call
            .parsed_arguments()
            .map_err(|e| LlmError::Parse(e.to_string()))?;
        let value: T = serde_json::from_value(arguments).map_err(|e| LlmError::Parse(e.to_string()))?;

        for (check, message) in &self.assertions {
            if !check(&value) {
                return Err(LlmError::Assertion(message.clone()));
            }
        }
        Ok(value)
    }
}

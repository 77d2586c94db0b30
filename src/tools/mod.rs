//! Tools the coding agent can call against its sandbox.
//!
//! Every tool takes JSON arguments that are deserialized into a typed struct
//! before anything runs. Sandbox failures never abort the run: they come back
//! to the model as descriptive text so it can react. Only malformed arguments
//! are reported as `Err`, and the registry turns those into text as well.

mod files;
mod terminal;

pub(crate) use files::{CreateOrUpdateFiles, ReadFiles};
pub(crate) use terminal::Terminal;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::llm::{FunctionDefinition, ToolDefinition};
use crate::sandbox::SandboxProvider;
use crate::state::FileSet;

/// Everything a tool may touch during one invocation.
///
/// Tools see the run's generated files but never its summary.
pub(crate) struct ToolContext<'a> {
    pub sandbox: &'a dyn SandboxProvider,
    pub session_id: &'a str,
    pub files: &'a mut FileSet,
}

/// A callable tool.
#[async_trait]
pub(crate) trait Tool: Send + Sync {
    /// The unique name the model calls this tool by.
    fn name(&self) -> &'static str;

    /// What the tool does, shown to the model.
    fn description(&self) -> &'static str;

    /// JSON schema for the tool's arguments.
    fn parameters_schema(&self) -> Value;

    /// Runs the tool.
    ///
    /// Returns `Err` only when `args` do not match the schema; execution
    /// failures are rendered into the returned text.
    async fn execute(&self, args: Value, ctx: &mut ToolContext<'_>) -> Result<String>;
}

/// Deserializes tool arguments into their typed form.
pub(crate) fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T> {
    serde_json::from_value(args).with_context(|| format!("Invalid arguments for {tool}"))
}

/// The fixed set of tools offered to the coding agent.
pub(crate) struct ToolRegistry {
    tools: BTreeMap<&'static str, Arc<dyn Tool>>,
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ToolRegistry {
    /// Registry with `terminal`, `createOrUpdateFiles` and `readFiles`.
    pub fn new() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(Terminal));
        registry.register(Arc::new(CreateOrUpdateFiles));
        registry.register(Arc::new(ReadFiles));
        registry
    }

    pub fn empty() -> Self {
        Self {
            tools: BTreeMap::new(),
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name(), tool);
    }

    /// Definitions advertised to the model.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools
            .values()
            .map(|tool| ToolDefinition {
                tool_type: "function".to_string(),
                function: FunctionDefinition {
                    name: tool.name().to_string(),
                    description: tool.description().to_string(),
                    parameters: tool.parameters_schema(),
                },
            })
            .collect()
    }

    /// Invokes a tool by name with its raw JSON argument string.
    ///
    /// Unknown tools and malformed arguments produce an error text for the
    /// model; they never fail the run.
    pub async fn invoke(&self, name: &str, arguments: &str, ctx: &mut ToolContext<'_>) -> String {
        let Some(tool) = self.tools.get(name) else {
            warn!("Model called unknown tool '{}'", name);
            return format!(
                "Error: unknown tool '{name}'. Available tools: {}",
                self.tools.keys().copied().collect::<Vec<_>>().join(", ")
            );
        };

        let args = if arguments.trim().is_empty() {
            Value::Object(serde_json::Map::new())
        } else {
            match serde_json::from_str::<Value>(arguments) {
                Ok(args) => args,
                Err(e) => {
                    warn!("Tool '{}' called with unparseable arguments: {}", name, e);
                    return format!("Error: arguments for {name} are not valid JSON: {e}");
                }
            }
        };

        debug!("Invoking tool '{}'", name);
        match tool.execute(args, ctx).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Tool '{}' rejected its arguments: {:#}", name, e);
                format!("Error: {e:#}")
            }
        }
    }
}

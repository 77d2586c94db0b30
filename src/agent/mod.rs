//! Model-driven agents.
//!
//! An [`Agent`] is a model, a system prompt and optionally a tool registry.
//! One invocation keeps calling the model, executing requested tools and
//! feeding their results back, until the model answers with plain text or the
//! run's iteration budget is spent. The [`Orchestrator`] decides whether to
//! invoke the agent again after each invocation.

mod router;

pub(crate) use router::{Orchestrator, RunOutcome, TerminationReason};

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::llm::{ChatMessage, ChatOptions, LlmClient, Role};
use crate::tools::{ToolContext, ToolRegistry};

/// Run-wide cap on model calls.
///
/// Shared by every agent invocation of a run, so the number of invocations
/// can never exceed the number of model calls, which never exceeds the limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct IterationBudget {
    limit: u32,
    used: u32,
}

impl IterationBudget {
    pub fn new(limit: u32) -> Self {
        Self { limit, used: 0 }
    }

    /// Takes one unit. Returns false when nothing is left.
    pub fn try_consume(&mut self) -> bool {
        if self.is_exhausted() {
            return false;
        }
        self.used += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.used
    }

    pub fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.used)
    }

    pub fn is_exhausted(&self) -> bool {
        self.used >= self.limit
    }
}

/// Messages produced by one agent invocation.
#[derive(Debug, Clone, Default)]
pub(crate) struct AgentOutput {
    pub messages: Vec<ChatMessage>,
}

impl AgentOutput {
    /// Text of the most recent assistant message that carried any.
    pub fn last_assistant_text(&self) -> Option<&str> {
        self.messages
            .iter()
            .rev()
            .filter(|m| m.role == Role::Assistant)
            .find_map(ChatMessage::text)
    }
}

/// A model with a system prompt and, for the coding agent, tools.
pub(crate) struct Agent {
    name: &'static str,
    system_prompt: String,
    model: String,
    options: ChatOptions,
    tools: Option<ToolRegistry>,
}

impl Agent {
    pub fn new(
        name: &'static str,
        system_prompt: impl Into<String>,
        model: impl Into<String>,
        options: ChatOptions,
    ) -> Self {
        Self {
            name,
            system_prompt: system_prompt.into(),
            model: model.into(),
            options,
            tools: None,
        }
    }

    #[must_use]
    pub fn with_tools(mut self, tools: ToolRegistry) -> Self {
        self.tools = Some(tools);
        self
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Runs one invocation against `conversation`, appending every assistant
    /// and tool message it produces.
    ///
    /// Each model call takes one unit from `budget`; the invocation ends early
    /// when the budget runs out between tool rounds.
    pub async fn run(
        &self,
        llm: &dyn LlmClient,
        conversation: &mut Vec<ChatMessage>,
        ctx: &mut ToolContext<'_>,
        budget: &mut IterationBudget,
    ) -> Result<AgentOutput> {
        let start = conversation.len();
        let definitions = self.tools.as_ref().map(ToolRegistry::definitions);

        while budget.try_consume() {
            let mut messages = Vec::with_capacity(conversation.len() + 1);
            messages.push(ChatMessage::system(self.system_prompt.as_str()));
            messages.extend(conversation.iter().cloned());

            let response = llm
                .chat_completion(&self.model, &messages, definitions.as_deref(), &self.options)
                .await
                .with_context(|| format!("{} agent model call failed", self.name))?;

            if let Some(usage) = response.usage {
                debug!(
                    "{} usage: prompt={} completion={} finish={:?}",
                    self.name, usage.prompt_tokens, usage.completion_tokens, response.finish_reason
                );
            }

            let tool_calls = response.tool_calls.unwrap_or_default();
            conversation.push(ChatMessage::assistant(
                response.content,
                Some(tool_calls.clone()),
            ));

            let Some(tools) = self.tools.as_ref().filter(|_| !tool_calls.is_empty()) else {
                break;
            };

            for call in &tool_calls {
                info!("{} -> {}", self.name, call.function.name);
                let result = tools
                    .invoke(&call.function.name, &call.function.arguments, ctx)
                    .await;
                conversation.push(ChatMessage::tool_result(call.id.as_str(), result));
            }

            if budget.is_exhausted() {
                debug!("{} stopped mid-invocation: iteration budget spent", self.name);
            }
        }

        Ok(AgentOutput {
            messages: conversation[start..].to_vec(),
        })
    }

    /// Single model call without tools, for the auxiliary generators.
    pub async fn run_once(&self, llm: &dyn LlmClient, input: &str) -> Result<AgentOutput> {
        let messages = [
            ChatMessage::system(self.system_prompt.as_str()),
            ChatMessage::user(input),
        ];
        let response = llm
            .chat_completion(&self.model, &messages, None, &self.options)
            .await
            .with_context(|| format!("{} agent model call failed", self.name))?;

        Ok(AgentOutput {
            messages: vec![ChatMessage::assistant(response.content, None)],
        })
    }
}

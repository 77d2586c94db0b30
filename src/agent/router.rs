//! Routing between agent invocations.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::{Agent, AgentOutput, IterationBudget};
use crate::detection::CompletionDetector;
use crate::llm::{ChatMessage, LlmClient};
use crate::sandbox::SandboxProvider;
use crate::state::AgentState;
use crate::tools::ToolContext;

/// What to do after an agent invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RouteDecision {
    Continue,
    Stop(TerminationReason),
}

/// Why the orchestrator stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub(crate) enum TerminationReason {
    /// The agent emitted its task summary.
    Completed,
    /// The iteration budget ran out first.
    IterationLimit,
}

impl std::fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Completed => write!(f, "completed"),
            Self::IterationLimit => write!(f, "iteration_limit"),
        }
    }
}

/// Final state of an orchestrated run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RunOutcome {
    pub state: AgentState,
    pub termination: TerminationReason,
    pub agent_invocations: u32,
    pub model_calls: u32,
}

/// Drives the coding agent until it reports completion or the budget runs out.
pub(crate) struct Orchestrator<'a> {
    agent: &'a Agent,
    llm: &'a dyn LlmClient,
    detector: CompletionDetector,
    max_iterations: u32,
}

impl<'a> Orchestrator<'a> {
    pub fn new(agent: &'a Agent, llm: &'a dyn LlmClient, max_iterations: u32) -> Self {
        Self {
            agent,
            llm,
            detector: CompletionDetector::default(),
            max_iterations,
        }
    }

    /// STOP as soon as a summary exists or no budget is left.
    pub fn route(state: &AgentState, budget: &IterationBudget) -> RouteDecision {
        if state.summary().is_some() {
            RouteDecision::Stop(TerminationReason::Completed)
        } else if budget.is_exhausted() {
            RouteDecision::Stop(TerminationReason::IterationLimit)
        } else {
            RouteDecision::Continue
        }
    }

    /// Records the summary if the invocation's last assistant text carries the marker.
    fn on_response(&self, state: &mut AgentState, output: &AgentOutput) {
        if let Some(summary) = self.detector.detect(output.last_assistant_text()) {
            if state.record_summary(summary) {
                info!("Task summary recorded");
            }
        }
    }

    /// Runs the agent loop over a fresh [`AgentState`], seeded with `history`.
    pub async fn run(
        &self,
        history: Vec<ChatMessage>,
        sandbox: &dyn SandboxProvider,
        session_id: &str,
    ) -> Result<RunOutcome> {
        let mut state = AgentState::default();
        let mut budget = IterationBudget::new(self.max_iterations);
        let mut conversation = history;
        let mut agent_invocations = 0;

        let termination = loop {
            if let RouteDecision::Stop(reason) = Self::route(&state, &budget) {
                break reason;
            }

            agent_invocations += 1;
            tracing::info!(
                event = "iteration_start",
                agent = self.agent.name(),
                iteration = agent_invocations,
                remaining = budget.remaining(),
            );

            let output = {
                let mut ctx = ToolContext {
                    sandbox,
                    session_id,
                    files: &mut state.files,
                };
                self.agent
                    .run(self.llm, &mut conversation, &mut ctx, &mut budget)
                    .await?
            };
            self.on_response(&mut state, &output);

            tracing::info!(
                event = "iteration_complete",
                iteration = agent_invocations,
                model_calls = budget.used(),
                files = state.files.len(),
                summary = state.summary().is_some(),
            );
        };

        debug!(
            "Orchestrator stopped ({}) after {} invocation(s), {} model call(s)",
            termination,
            agent_invocations,
            budget.used()
        );

        Ok(RunOutcome {
            state,
            termination,
            agent_invocations,
            model_calls: budget.used(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::{MockLlm, MockReply};
    use crate::llm::{ChatOptions, ToolCall};
    use crate::sandbox::memory::InMemorySandbox;
    use crate::tools::ToolRegistry;

    fn coding_agent() -> Agent {
        Agent::new("code", "system", "gpt-4.1", ChatOptions::default())
            .with_tools(ToolRegistry::new())
    }

    fn write_call(id: &str, path: &str, content: &str) -> MockReply {
        MockReply::Tools(vec![ToolCall::new(
            id,
            "createOrUpdateFiles",
            serde_json::json!({"files": [{"path": path, "content": content}]}).to_string(),
        )])
    }

    async fn orchestrate(llm: &MockLlm, max_iterations: u32) -> (RunOutcome, InMemorySandbox) {
        let sandbox = InMemorySandbox::new();
        let id = sandbox.create("t").await.unwrap();
        let agent = coding_agent();
        let outcome = Orchestrator::new(&agent, llm, max_iterations)
            .run(vec![ChatMessage::user("build")], &sandbox, &id)
            .await
            .unwrap();
        (outcome, sandbox)
    }

    #[test]
    fn test_route_decisions() {
        let mut state = AgentState::default();
        let mut budget = IterationBudget::new(1);
        assert_eq!(Orchestrator::route(&state, &budget), RouteDecision::Continue);

        budget.try_consume();
        assert_eq!(
            Orchestrator::route(&state, &budget),
            RouteDecision::Stop(TerminationReason::IterationLimit)
        );

        state.record_summary("<task_summary>x</task_summary>".to_string());
        assert_eq!(
            Orchestrator::route(&state, &budget),
            RouteDecision::Stop(TerminationReason::Completed)
        );
    }

    #[tokio::test]
    async fn test_completes_when_marker_emitted() {
        let llm = MockLlm::new(vec![
            write_call("c1", "index.html", "<html></html>"),
            MockReply::Text("<task_summary>Done</task_summary>".to_string()),
        ]);

        let (outcome, _) = orchestrate(&llm, 15).await;

        assert_eq!(outcome.termination, TerminationReason::Completed);
        assert_eq!(outcome.agent_invocations, 1);
        assert_eq!(outcome.model_calls, 2);
        assert_eq!(outcome.state.summary(), Some("<task_summary>Done</task_summary>"));
        assert!(outcome.state.is_complete());
    }

    #[tokio::test]
    async fn test_no_marker_stops_at_ceiling() {
        let llm = MockLlm::always("still thinking");

        let (outcome, _) = orchestrate(&llm, 15).await;

        assert_eq!(outcome.termination, TerminationReason::IterationLimit);
        assert_eq!(outcome.agent_invocations, 15);
        assert_eq!(llm.call_count(), 15);
        assert!(outcome.state.summary().is_none());
    }

    #[tokio::test]
    async fn test_invocations_never_exceed_ceiling_with_tool_rounds() {
        let llm = MockLlm::repeating(vec![
            write_call("c", "a.js", "x"),
            MockReply::Text("no marker".to_string()),
        ]);

        let (outcome, _) = orchestrate(&llm, 4).await;

        assert!(outcome.agent_invocations <= 4);
        assert_eq!(llm.call_count(), 4);
        assert_eq!(outcome.termination, TerminationReason::IterationLimit);
    }

    #[tokio::test]
    async fn test_summary_is_never_overwritten() {
        let llm = MockLlm::repeating(vec![MockReply::Text(
            "<task_summary>first</task_summary>".to_string(),
        )]);

        let (outcome, _) = orchestrate(&llm, 15).await;

        assert_eq!(outcome.agent_invocations, 1);
        assert_eq!(llm.call_count(), 1);
        assert_eq!(outcome.state.summary(), Some("<task_summary>first</task_summary>"));
    }

    #[tokio::test]
    async fn test_malformed_tool_arguments_do_not_end_run() {
        let llm = MockLlm::new(vec![
            MockReply::Tools(vec![ToolCall::new("bad", "createOrUpdateFiles", "{\"files\": 3}")]),
            write_call("good", "index.html", "<html></html>"),
            MockReply::Text("<task_summary>Fixed</task_summary>".to_string()),
        ]);

        let (outcome, _) = orchestrate(&llm, 15).await;

        assert_eq!(outcome.termination, TerminationReason::Completed);
        assert_eq!(outcome.state.files.get("index.html"), Some("<html></html>"));
        let second = &llm.requests()[1];
        let tool_reply = second.messages.last().unwrap();
        assert!(tool_reply.text().unwrap().starts_with("Error: Invalid arguments"));
    }

    #[tokio::test]
    async fn test_history_seeds_conversation() {
        let llm = MockLlm::always("<task_summary>x</task_summary>");
        let sandbox = InMemorySandbox::new();
        let id = sandbox.create("t").await.unwrap();
        let agent = coding_agent();
        let history = vec![
            ChatMessage::user("make a todo app"),
            ChatMessage::assistant(Some("Here you go.".to_string()), None),
            ChatMessage::user("add dark mode"),
        ];

        Orchestrator::new(&agent, &llm, 15)
            .run(history, &sandbox, &id)
            .await
            .unwrap();

        let sent = &llm.requests()[0].messages;
        assert_eq!(sent.len(), 4);
        assert_eq!(sent[3].text(), Some("add dark mode"));
    }
}

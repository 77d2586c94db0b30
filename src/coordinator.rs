//! The code generation workflow.
//!
//! A run provisions a sandbox, replays the project's conversation to the
//! coding agent, lets the orchestrator drive it until it reports completion or
//! runs out of budget, then names and describes the result and stores exactly
//! one assistant turn. Steps that touch the outside world are journaled in the
//! run record so an interrupted run can be resumed without redoing them.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::agent::{Agent, Orchestrator, RunOutcome, TerminationReason};
use crate::config::Config;
use crate::journal::StepJournal;
use crate::llm::{ChatMessage, ChatOptions, LlmClient, Role};
use crate::notifications::{NotificationDetails, Notifier};
use crate::sandbox::SandboxProvider;
use crate::state::{RunRecord, RunStatus};
use crate::store::{
    validate_project_id, ConversationStore, ConversationTurn, Fragment, MessageKind, MessageRole,
    RunStore,
};
use crate::templates::{AGENT_PROMPT, FRAGMENT_TITLE_PROMPT, RESPONSE_PROMPT};
use crate::tools::ToolRegistry;

/// Content of the assistant turn stored when a run produced nothing usable.
pub(crate) const ERROR_MESSAGE: &str = "Something went wrong. Please try again..";
pub(crate) const DEFAULT_TITLE: &str = "Fragment";
pub(crate) const DEFAULT_RESPONSE: &str = "Here you go.";
pub(crate) const MAX_PROMPT_CHARS: usize = 10_000;

const STEP_SANDBOX_ID: &str = "get-sandbox-id";
const STEP_PREVIOUS_MESSAGES: &str = "get-previous-messages";
const STEP_CODE_AGENT: &str = "code-agent";
const STEP_SANDBOX_URL: &str = "get-sandbox-url";
const STEP_SAVE_RESULT: &str = "save-result";
const STEP_RELEASE_SANDBOX: &str = "release-sandbox";
const STEP_NOTIFY: &str = "notify";

/// What a finished run hands back to its caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct RunOutput {
    pub run_id: Uuid,
    pub project_id: String,
    pub url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
    pub summary: Option<String>,
    pub succeeded: bool,
    /// Why no fragment was produced.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    pub agent_invocations: u32,
    pub model_calls: u32,
}

/// Result stored by a run's save step, if it got that far.
pub(crate) fn saved_output(run: &RunRecord) -> Result<Option<RunOutput>> {
    run.steps
        .get(STEP_SAVE_RESULT)
        .map(|stored| {
            serde_json::from_value(stored.clone())
                .with_context(|| format!("Stored result of run {} is unreadable", run.id))
        })
        .transpose()
}

/// Checks a user prompt before anything is stored.
pub(crate) fn validate_prompt(prompt: &str) -> Result<()> {
    if prompt.trim().is_empty() {
        bail!("Prompt cannot be empty.");
    }
    let chars = prompt.chars().count();
    if chars > MAX_PROMPT_CHARS {
        bail!("Prompt is too long ({chars} characters, maximum is {MAX_PROMPT_CHARS}).");
    }
    Ok(())
}

/// Maps stored turns to chat messages, keeping the most recent `max_turns`.
pub(crate) fn conversation_history(
    turns: &[ConversationTurn],
    max_turns: Option<usize>,
) -> Vec<ChatMessage> {
    let skip = max_turns.map_or(0, |max| turns.len().saturating_sub(max));
    turns
        .iter()
        .skip(skip)
        .map(|turn| match turn.role {
            MessageRole::Assistant => ChatMessage::assistant(Some(turn.content.clone()), None),
            MessageRole::User => ChatMessage::user(turn.content.as_str()),
        })
        .collect()
}

/// Appends the prompt unless it already is the last user turn of `history`.
fn with_prompt(mut history: Vec<ChatMessage>, prompt: &str) -> Vec<ChatMessage> {
    let already_last = history
        .last()
        .is_some_and(|m| m.role == Role::User && m.text() == Some(prompt));
    if !already_last {
        history.push(ChatMessage::user(prompt));
    }
    history
}

fn failure_reason(outcome: &RunOutcome) -> Option<String> {
    let state = &outcome.state;
    if state.is_complete() {
        return None;
    }
    Some(match (state.summary(), outcome.termination) {
        (Some(_), _) => "the agent finished without writing any files".to_string(),
        (None, TerminationReason::IterationLimit) => format!(
            "no task summary after {} model calls",
            outcome.model_calls
        ),
        (None, TerminationReason::Completed) => "the agent produced no task summary".to_string(),
    })
}

/// Runs the workflow against injected backends.
pub(crate) struct RunCoordinator<'a> {
    config: &'a Config,
    llm: &'a dyn LlmClient,
    sandbox: &'a dyn SandboxProvider,
    conversations: &'a dyn ConversationStore,
    runs: &'a dyn RunStore,
    notifier: Notifier,
}

impl<'a> RunCoordinator<'a> {
    pub fn new(
        config: &'a Config,
        llm: &'a dyn LlmClient,
        sandbox: &'a dyn SandboxProvider,
        conversations: &'a dyn ConversationStore,
        runs: &'a dyn RunStore,
    ) -> Self {
        Self {
            config,
            llm,
            sandbox,
            conversations,
            runs,
            notifier: Notifier::new(config.notifications.clone()),
        }
    }

    /// Stores the user's prompt in the project conversation and runs the workflow.
    pub async fn submit(&self, project_id: &str, prompt: &str) -> Result<RunOutput> {
        validate_prompt(prompt)?;
        validate_project_id(project_id)?;

        let turn =
            ConversationTurn::new(project_id, MessageRole::User, MessageKind::Result, prompt);
        self.conversations
            .create(&turn)
            .await
            .context("Failed to store the prompt")?;

        let run = RunRecord::new(project_id, prompt);
        self.runs.save_run(&run).await?;
        self.execute(run).await
    }

    /// Continues a run that stopped on an infrastructure error.
    pub async fn resume(&self, run_id: Uuid) -> Result<RunOutput> {
        let Some(run) = self.runs.load_run(run_id).await? else {
            bail!("Run {run_id} not found");
        };
        if run.is_terminal() {
            bail!("Run {run_id} already {}", run.status);
        }
        info!("Resuming run {} ({} step(s) recorded)", run.id, run.steps.len());
        self.execute(run).await
    }

    async fn execute(&self, run: RunRecord) -> Result<RunOutput> {
        let mut journal = StepJournal::new(run, self.runs);
        journal.transition(RunStatus::Running).await?;

        tracing::info!(
            event = "run_start",
            run_id = %journal.run().id,
            project_id = %journal.run().project_id,
        );

        match self.drive(&mut journal).await {
            Ok(output) => Ok(output),
            Err(e) => {
                tracing::info!(
                    event = "error",
                    run_id = %journal.run().id,
                    error = %format!("{e:#}"),
                );
                if let Err(save_err) = journal.record_error(&e).await {
                    warn!("Could not record run error: {:#}", save_err);
                }
                Err(e)
            }
        }
    }

    async fn drive(&self, journal: &mut StepJournal<'_>) -> Result<RunOutput> {
        let run_id = journal.run().id;
        let project_id = journal.run().project_id.clone();
        let prompt = journal.run().prompt.clone();
        let sandbox = self.sandbox;
        let conversations = self.conversations;

        let template = self.config.sandbox.template.as_str();
        let session_id: String = journal
            .step(STEP_SANDBOX_ID, || async move {
                let id = sandbox.create(template).await?;
                info!("Created sandbox {} from {}", id, template);
                Ok(id)
            })
            .await?;

        if let Some(output) = journal.recorded::<RunOutput>(STEP_SAVE_RESULT)? {
            info!("Run {} already saved its result", run_id);
            return self.finish(journal, &session_id, output).await;
        }

        let max_turns = self.config.history.max_turns;
        let history_project = project_id.as_str();
        let history: Vec<ChatMessage> = journal
            .step(STEP_PREVIOUS_MESSAGES, || async move {
                let turns = conversations.find_many(history_project).await?;
                Ok(conversation_history(&turns, max_turns))
            })
            .await?;

        let coding_agent = Agent::new(
            "code-agent",
            AGENT_PROMPT,
            self.config.model.name.as_str(),
            ChatOptions {
                temperature: Some(self.config.model.temperature),
                max_tokens: None,
            },
        )
        .with_tools(ToolRegistry::new());

        let orchestrator =
            Orchestrator::new(&coding_agent, self.llm, self.config.agent.max_iterations);
        let orchestrator = &orchestrator;
        let agent_session = session_id.as_str();
        let conversation = with_prompt(history, &prompt);
        let outcome: RunOutcome = journal
            .step(STEP_CODE_AGENT, || async move {
                orchestrator.run(conversation, sandbox, agent_session).await
            })
            .await?;

        let (title, response) = self.describe(outcome.state.summary()).await?;

        let port = self.config.sandbox.port;
        let url_session = session_id.as_str();
        let url: String = journal
            .step(STEP_SANDBOX_URL, || async move {
                sandbox.connect(url_session).await?.public_url(port).await
            })
            .await?;

        let failure = failure_reason(&outcome);
        let output = RunOutput {
            run_id,
            project_id: project_id.clone(),
            url,
            title,
            files: outcome.state.files.as_map().clone(),
            summary: outcome.state.summary().map(str::to_string),
            succeeded: failure.is_none(),
            failure_reason: failure,
            agent_invocations: outcome.agent_invocations,
            model_calls: outcome.model_calls,
        };

        let mut turn = if output.succeeded {
            let fragment = Fragment {
                sandbox_url: output.url.clone(),
                title: output.title.clone(),
                files: output.files.clone(),
            };
            ConversationTurn::new(
                &project_id,
                MessageRole::Assistant,
                MessageKind::Result,
                response,
            )
            .with_fragment(fragment)
        } else {
            ConversationTurn::new(
                &project_id,
                MessageRole::Assistant,
                MessageKind::Error,
                ERROR_MESSAGE,
            )
        };
        // One assistant turn per run, even if the save step is retried.
        turn.id = Uuid::new_v5(&run_id, STEP_SAVE_RESULT.as_bytes());
        let output: RunOutput = journal
            .step(STEP_SAVE_RESULT, || async move {
                conversations.create(&turn).await?;
                Ok(output)
            })
            .await?;

        self.finish(journal, &session_id, output).await
    }

    /// Title and user-facing response, generated concurrently from the summary.
    async fn describe(&self, summary: Option<&str>) -> Result<(String, String)> {
        let Some(summary) = summary.filter(|s| !s.trim().is_empty()) else {
            return Ok((DEFAULT_TITLE.to_string(), DEFAULT_RESPONSE.to_string()));
        };

        let model = self.config.model.auxiliary.as_str();
        let title_agent = Agent::new(
            "fragment-title-generator",
            FRAGMENT_TITLE_PROMPT,
            model,
            ChatOptions::default(),
        );
        let response_agent =
            Agent::new("response-generator", RESPONSE_PROMPT, model, ChatOptions::default());

        tokio::try_join!(
            self.generate(&title_agent, summary, DEFAULT_TITLE),
            self.generate(&response_agent, summary, DEFAULT_RESPONSE),
        )
    }

    async fn generate(&self, agent: &Agent, summary: &str, default: &str) -> Result<String> {
        let output = agent.run_once(self.llm, summary).await?;
        Ok(output
            .last_assistant_text()
            .map(str::trim)
            .filter(|text| !text.is_empty())
            .unwrap_or(default)
            .to_string())
    }

    /// Failure-path cleanup, notification and the final status.
    async fn finish(
        &self,
        journal: &mut StepJournal<'_>,
        session_id: &str,
        output: RunOutput,
    ) -> Result<RunOutput> {
        let sandbox = self.sandbox;
        if !output.succeeded {
            let _released: bool = journal
                .step(STEP_RELEASE_SANDBOX, || async move {
                    match sandbox.release(session_id).await {
                        Ok(()) => Ok(true),
                        Err(e) => {
                            warn!("Failed to release sandbox {}: {:#}", session_id, e);
                            Ok(false)
                        }
                    }
                })
                .await?;
        }

        let details = if output.succeeded {
            NotificationDetails::complete(
                output.run_id,
                &output.project_id,
                &output.title,
                &output.url,
            )
        } else {
            NotificationDetails::error(
                output.run_id,
                &output.project_id,
                output.failure_reason.as_deref().unwrap_or(ERROR_MESSAGE),
            )
        };
        let notifier = &self.notifier;
        journal
            .step(STEP_NOTIFY, || async move {
                notifier.notify(&details).await;
                Ok(())
            })
            .await?;

        journal.clear_error().await?;
        let status = if output.succeeded {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        };
        journal.transition(status).await?;

        tracing::info!(
            event = "run_end",
            run_id = %output.run_id,
            status = %status,
            files = output.files.len(),
            model_calls = output.model_calls,
        );
        Ok(output)
    }
}

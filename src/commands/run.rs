//! `imaginate run`: submit a prompt, or resume an interrupted run.

use anyhow::{bail, Context, Result};
use colored::Colorize;
use tracing::debug;
use uuid::Uuid;

use super::format::{format_resume_hint, format_run_banner, format_run_output};
use super::Workspace;
use crate::coordinator::{validate_prompt, RunCoordinator, RunOutput};
use crate::llm::OpenAiClient;
use crate::sandbox::{DockerSandbox, SandboxError};
use crate::store::{validate_project_id, RunStore};

/// What the command should execute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Target {
    New {
        prompt: String,
        project: Option<String>,
    },
    Resume(Uuid),
}

/// Target with defaults applied and input validated.
enum Job {
    Submit { prompt: String, project_id: String },
    Resume(Uuid),
}

impl Job {
    fn prepare(target: Target) -> Result<Self> {
        Ok(match target {
            Target::New { prompt, project } => {
                validate_prompt(&prompt)?;
                let project_id = project.unwrap_or_else(|| Uuid::new_v4().to_string());
                validate_project_id(&project_id)?;
                Self::Submit { prompt, project_id }
            }
            Target::Resume(run_id) => Self::Resume(run_id),
        })
    }
}

pub(crate) async fn run(workspace: &Workspace, target: Target, json: bool) -> Result<()> {
    let config = &workspace.config;

    // Reject bad input before any backend is contacted.
    let job = Job::prepare(target)?;
    if let Job::Submit { prompt, project_id } = &job {
        if !json {
            let model = &config.model.name;
            let banner = format_run_banner(project_id, prompt, model, config.agent.max_iterations);
            print!("{banner}");
        }
    }

    let llm = OpenAiClient::from_config(&config.model)?;
    let sandbox = DockerSandbox::connect_local(config.sandbox.clone())
        .await
        .map_err(with_sandbox_hint)?;
    let store = workspace.store();
    let coordinator = RunCoordinator::new(config, &llm, &sandbox, &store, &store);

    let result = match &job {
        Job::Submit { prompt, project_id } => coordinator.submit(project_id, prompt).await,
        Job::Resume(run_id) => coordinator.resume(*run_id).await,
    };

    let output = match result {
        Ok(output) => output,
        Err(e) => {
            let resumable = match &job {
                Job::Submit { project_id, .. } => latest_resumable(&store, project_id).await,
                Job::Resume(run_id) => Some(*run_id),
            };
            if let Some(run_id) = resumable {
                eprint!("{}", format_resume_hint(&run_id.to_string()));
            }
            return Err(with_sandbox_hint(e));
        }
    };

    print_output(&output, json)?;
    if !output.succeeded {
        bail!("Run {} finished without a fragment", output.run_id);
    }
    Ok(())
}

fn print_output(output: &RunOutput, json: bool) -> Result<()> {
    if json {
        let text = serde_json::to_string_pretty(output).context("Failed to serialize run output")?;
        println!("{text}");
    } else {
        print!("{}", format_run_output(output));
    }
    Ok(())
}

/// Newest run of `project_id` that stopped on an error and can be resumed.
async fn latest_resumable(store: &dyn RunStore, project_id: &str) -> Option<Uuid> {
    match store.list_runs(Some(project_id)).await {
        Ok(runs) => runs
            .into_iter()
            .find(|run| !run.is_terminal() && run.last_error.is_some())
            .map(|run| run.id),
        Err(e) => {
            debug!("Could not look up resumable runs: {:#}", e);
            None
        }
    }
}

/// Adds an actionable hint to sandbox failures the user can fix.
fn with_sandbox_hint(error: anyhow::Error) -> anyhow::Error {
    let hint = error
        .chain()
        .find_map(|cause| cause.downcast_ref::<SandboxError>())
        .and_then(|sandbox_error| {
            if sandbox_error.is_docker_unavailable() {
                Some(format!(
                    "Start Docker (or set {}) and try again",
                    "DOCKER_HOST".cyan()
                ))
            } else if sandbox_error.is_session_not_found() {
                Some(
                    "The sandbox expired before the run finished; submit the prompt again"
                        .to_string(),
                )
            } else if sandbox_error.is_timeout() {
                Some(format!(
                    "Raise {} in imaginate.toml for slow commands",
                    "sandbox.command_timeout_secs".cyan()
                ))
            } else {
                None
            }
        });
    match hint {
        Some(hint) => error.context(hint),
        None => error,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{RunRecord, RunStatus};
    use crate::store::FileStore;
    use std::time::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_prepare_validates_and_assigns_project() {
        let job = Job::prepare(Target::New {
            prompt: "build a todo app".to_string(),
            project: None,
        })
        .unwrap();
        match job {
            Job::Submit { project_id, .. } => assert!(Uuid::parse_str(&project_id).is_ok()),
            Job::Resume(_) => panic!("expected a submission"),
        }

        assert!(Job::prepare(Target::New {
            prompt: "   ".to_string(),
            project: None,
        })
        .is_err());
        assert!(Job::prepare(Target::New {
            prompt: "ok".to_string(),
            project: Some("../escape".to_string()),
        })
        .is_err());
    }

    #[test]
    fn test_docker_unavailable_gets_hint() {
        let err = anyhow::Error::new(SandboxError::docker_unavailable("no socket"));
        let message = format!("{:#}", with_sandbox_hint(err));
        assert!(message.contains("Start Docker"));
        assert!(message.contains("no socket"));
    }

    #[test]
    fn test_timeout_gets_hint() {
        let err = anyhow::Error::new(SandboxError::timeout(Duration::from_secs(60)))
            .context("Step 'get-sandbox-url' failed");
        let message = format!("{:#}", with_sandbox_hint(err));
        assert!(message.contains("command_timeout_secs"));
    }

    #[test]
    fn test_expired_session_gets_hint() {
        let err = anyhow::Error::new(SandboxError::session_not_found("abc123"));
        let message = format!("{:#}", with_sandbox_hint(err));
        assert!(message.contains("submit the prompt again"));
    }

    #[test]
    fn test_other_errors_unchanged() {
        let err = anyhow::anyhow!("model said no");
        assert_eq!(format!("{:#}", with_sandbox_hint(err)), "model said no");
    }

    #[tokio::test]
    async fn test_latest_resumable_finds_errored_running_run() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());

        let mut done = RunRecord::new("proj", "a");
        done.transition(RunStatus::Failed);
        store.save_run(&done).await.unwrap();
        assert!(latest_resumable(&store, "proj").await.is_none());

        let mut stuck = RunRecord::new("proj", "b");
        stuck.transition(RunStatus::Running);
        stuck.last_error = Some("Docker is not available".to_string());
        store.save_run(&stuck).await.unwrap();
        assert_eq!(latest_resumable(&store, "proj").await, Some(stuck.id));
        assert!(latest_resumable(&store, "other").await.is_none());
    }
}

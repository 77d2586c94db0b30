//! Pure formatting functions for command output.
//!
//! Everything here returns a `String`; printing is left to the commands.

use chrono::{DateTime, Utc};
use colored::Colorize;
use std::fmt::Write;

use crate::coordinator::RunOutput;
use crate::detection::summary_body;
use crate::state::{RunRecord, RunStatus};
use crate::store::{ConversationTurn, MessageKind, MessageRole};

const RULE_WIDTH: usize = 50;
const PREVIEW_CHARS: usize = 60;

fn rule() -> String {
    "━".repeat(RULE_WIDTH).dimmed().to_string()
}

fn status_label(status: RunStatus) -> String {
    let text = status.to_string();
    match status {
        RunStatus::Succeeded => text.green().to_string(),
        RunStatus::Failed => text.red().to_string(),
        RunStatus::Running => text.yellow().to_string(),
        RunStatus::Pending => text.dimmed().to_string(),
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S").to_string()
}

/// First line of `text`, shortened to `max` characters.
pub(crate) fn preview(text: &str, max: usize) -> String {
    let line = text.lines().next().unwrap_or_default().trim();
    if line.chars().count() <= max {
        line.to_string()
    } else {
        let cut: String = line.chars().take(max.saturating_sub(1)).collect();
        format!("{cut}…")
    }
}

/// Banner printed before a run starts.
pub(crate) fn format_run_banner(
    project_id: &str,
    prompt: &str,
    model: &str,
    max_iterations: u32,
) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{}", rule());
    let _ = writeln!(out, "{}", "   imaginate".yellow().bold());
    let _ = writeln!(out, "{}", rule());
    let _ = writeln!(out, "  Project:    {}", project_id.cyan().bold());
    let _ = writeln!(out, "  Model:      {}", model.cyan());
    let _ = writeln!(out, "  Max calls:  {}", max_iterations.to_string().cyan());
    let _ = writeln!(out, "  Prompt:     {}", preview(prompt, PREVIEW_CHARS));
    let _ = writeln!(out, "{}\n", rule());
    out
}

/// Result of a finished run.
pub(crate) fn format_run_output(output: &RunOutput) -> String {
    let mut out = String::new();

    if output.succeeded {
        let _ = writeln!(out, "\n{} {}", "✓".green().bold(), output.title.bold());
        let _ = writeln!(out, "  Preview:  {}", output.url.cyan().underline());
        let _ = writeln!(out, "  Files:");
        for path in output.files.keys() {
            let _ = writeln!(out, "    {path}");
        }
    } else {
        let _ = writeln!(out, "\n{} Run did not produce a fragment", "✗".red().bold());
        if let Some(reason) = &output.failure_reason {
            let _ = writeln!(out, "  Reason:   {reason}");
        }
    }

    if let Some(summary) = &output.summary {
        let _ = writeln!(
            out,
            "  Summary:  {}",
            preview(summary_body(summary), PREVIEW_CHARS * 2)
        );
    }
    let _ = writeln!(
        out,
        "  Calls:    {} model call(s), {} agent invocation(s)",
        output.model_calls, output.agent_invocations
    );
    let _ = writeln!(out, "  Project:  {}", output.project_id);
    let _ = writeln!(out, "  Run:      {}", output.run_id.to_string().dimmed());
    out
}

/// Hint printed when a run stops on an infrastructure error.
pub(crate) fn format_resume_hint(run_id: &str) -> String {
    format!(
        "  Run {} can be resumed with {}\n",
        run_id.dimmed(),
        format!("imaginate run --resume {run_id}").green()
    )
}

/// Conversation of one project, oldest turn first.
pub(crate) fn format_history(project_id: &str, turns: &[ConversationTurn]) -> String {
    let mut out = String::new();
    if turns.is_empty() {
        let _ = writeln!(out, "No messages in project {}", project_id.cyan());
        return out;
    }

    let _ = writeln!(out, "\n{} {}\n", "Project".bold(), project_id.cyan().bold());
    for turn in turns {
        let who = match turn.role {
            MessageRole::User => "you".blue().bold(),
            MessageRole::Assistant => "assistant".magenta().bold(),
        };
        let kind = match turn.kind {
            MessageKind::Result => String::new(),
            MessageKind::Error => format!(" {}", "[error]".red()),
        };
        let _ = writeln!(
            out,
            "{} {}{}",
            timestamp(&turn.created_at).dimmed(),
            who,
            kind
        );
        for line in turn.content.lines() {
            let _ = writeln!(out, "  {line}");
        }
        if let Some(fragment) = &turn.fragment {
            let _ = writeln!(
                out,
                "  {} {} ({} file(s)) {}",
                "▸".green(),
                fragment.title.bold(),
                fragment.files.len(),
                fragment.sandbox_url.cyan()
            );
        }
        let _ = writeln!(out);
    }
    out
}

/// One line per run, newest first.
pub(crate) fn format_run_list(runs: &[RunRecord]) -> String {
    let mut out = String::new();
    if runs.is_empty() {
        let _ = writeln!(out, "No runs recorded yet.");
        let _ = writeln!(out, "Start one with {}", "imaginate run \"...\"".green());
        return out;
    }

    let _ = writeln!(out, "{}", "Recent runs".bold());
    for run in runs {
        let _ = writeln!(
            out,
            "  {}  {:<20}  {:<10}  {}",
            run.id.to_string().dimmed(),
            run.project_id,
            status_label(run.status),
            preview(&run.prompt, PREVIEW_CHARS)
        );
    }
    out
}

/// Full detail of one run.
pub(crate) fn format_run_detail(run: &RunRecord, output: Option<&RunOutput>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "\n{}", rule());
    let _ = writeln!(out, "  Run:        {}", run.id.to_string().cyan());
    let _ = writeln!(out, "  Project:    {}", run.project_id);
    let _ = writeln!(out, "  Status:     {}", status_label(run.status));
    let _ = writeln!(out, "  Started:    {}", timestamp(&run.created_at));
    let _ = writeln!(out, "  Updated:    {}", timestamp(&run.updated_at));
    let _ = writeln!(out, "  Prompt:     {}", preview(&run.prompt, PREVIEW_CHARS));

    let steps: Vec<&str> = run.steps.keys().map(String::as_str).collect();
    let _ = writeln!(
        out,
        "  Steps:      {}",
        if steps.is_empty() {
            "none".dimmed().to_string()
        } else {
            steps.join(", ")
        }
    );

    if let Some(error) = &run.last_error {
        let _ = writeln!(out, "  Last error: {}", error.red());
    }
    if let Some(output) = output {
        if output.succeeded {
            let _ = writeln!(out, "  Title:      {}", output.title.bold());
            let _ = writeln!(out, "  Preview:    {}", output.url.cyan());
            let _ = writeln!(out, "  Files:      {}", output.files.len());
        } else if let Some(reason) = &output.failure_reason {
            let _ = writeln!(out, "  Reason:     {reason}");
        }
        let _ = writeln!(out, "  Calls:      {}", output.model_calls);
    }
    let _ = writeln!(out, "{}", rule());

    if !run.is_terminal() && run.last_error.is_some() {
        out.push_str(&format_resume_hint(&run.id.to_string()));
    }
    out
}

//! Shell command execution inside the sandbox.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, trace, warn};

use super::{parse_args, Tool, ToolContext};
use crate::sandbox::OutputChunk;

#[derive(Debug, Deserialize)]
struct TerminalArgs {
    command: String,
}

/// Runs a shell command and returns its stdout.
pub(crate) struct Terminal;

#[async_trait]
impl Tool for Terminal {
    fn name(&self) -> &'static str {
        "terminal"
    }

    fn description(&self) -> &'static str {
        "Use the terminal to run commands"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "Shell command to run in the sandbox"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(&self, args: Value, ctx: &mut ToolContext<'_>) -> Result<String> {
        let TerminalArgs { command } = parse_args(self.name(), args)?;
        info!("Running in sandbox {}: {}", ctx.session_id, command);

        let mut stdout = String::new();
        let mut stderr = String::new();
        let mut collect = |chunk: OutputChunk<'_>| match chunk {
            OutputChunk::Stdout(data) => {
                trace!(stream = "stdout", "{}", data);
                stdout.push_str(data);
            }
            OutputChunk::Stderr(data) => {
                trace!(stream = "stderr", "{}", data);
                stderr.push_str(data);
            }
        };

        let result = match ctx.sandbox.connect(ctx.session_id).await {
            Ok(handle) => handle.run_command(&command, &mut collect).await,
            Err(e) => Err(e),
        };

        Ok(match result {
            Ok(output) => output.stdout,
            Err(e) => {
                warn!("Command failed in sandbox {}: {:#}", ctx.session_id, e);
                format_failure(&e, &stdout, &stderr)
            }
        })
    }
}

fn format_failure(error: &anyhow::Error, stdout: &str, stderr: &str) -> String {
    format!("Command failed:\nerror: {error:#}\nstdout: {stdout}\nstderr: {stderr}")
}

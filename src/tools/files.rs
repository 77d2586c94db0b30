//! File tools: write into and read from the sandbox filesystem.

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{info, warn};

use super::{parse_args, Tool, ToolContext};
use crate::sandbox::SandboxProvider;

#[derive(Debug, Deserialize)]
struct FileEntry {
    path: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct WriteArgs {
    files: Vec<FileEntry>,
}

#[derive(Debug, Deserialize)]
struct ReadArgs {
    files: Vec<String>,
}

#[derive(Debug, Serialize)]
struct FileContent {
    path: String,
    content: String,
}

/// Result of writing a batch of files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum WriteOutcome {
    /// Every file was written; carries path -> content.
    Written(BTreeMap<String, String>),
    /// A write failed; nothing may be merged.
    Failed(String),
}

/// Writes every entry to the sandbox, stopping at the first failure.
async fn write_all(
    sandbox: &dyn SandboxProvider,
    session_id: &str,
    files: Vec<FileEntry>,
) -> WriteOutcome {
    let handle = match sandbox.connect(session_id).await {
        Ok(handle) => handle,
        Err(e) => return WriteOutcome::Failed(format!("{e:#}")),
    };

    let mut written = BTreeMap::new();
    for FileEntry { path, content } in files {
        if let Err(e) = handle.write_file(&path, &content).await {
            return WriteOutcome::Failed(format!("{e:#}"));
        }
        written.insert(path, content);
    }
    WriteOutcome::Written(written)
}

/// Creates or overwrites files and records them in the run's file set.
pub(crate) struct CreateOrUpdateFiles;

#[async_trait]
impl Tool for CreateOrUpdateFiles {
    fn name(&self) -> &'static str {
        "createOrUpdateFiles"
    }

    fn description(&self) -> &'static str {
        "Create or update files in the sandbox"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "files": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "path": {"type": "string"},
                            "content": {"type": "string"}
                        },
                        "required": ["path", "content"]
                    }
                }
            },
            "required": ["files"]
        })
    }

    async fn execute(&self, args: Value, ctx: &mut ToolContext<'_>) -> Result<String> {
        let WriteArgs { files } = parse_args(self.name(), args)?;
        let count = files.len();

        match write_all(ctx.sandbox, ctx.session_id, files).await {
            WriteOutcome::Written(written) => {
                info!("Wrote {} file(s) to sandbox {}", count, ctx.session_id);
                ctx.files.merge(written);
                Ok(serde_json::to_string(ctx.files.as_map())?)
            }
            WriteOutcome::Failed(message) => {
                warn!("File write failed in sandbox {}: {}", ctx.session_id, message);
                Ok(format!("Error: {message}"))
            }
        }
    }
}

/// Reads files back from the sandbox.
pub(crate) struct ReadFiles;

#[async_trait]
impl Tool for ReadFiles {
    fn name(&self) -> &'static str {
        "readFiles"
    }

    fn description(&self) -> &'static str {
        "Read files from the sandbox"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "files": {
                    "type": "array",
                    "items": {"type": "string"}
                }
            },
            "required": ["files"]
        })
    }

    async fn execute(&self, args: Value, ctx: &mut ToolContext<'_>) -> Result<String> {
        let ReadArgs { files } = parse_args(self.name(), args)?;

        let handle = match ctx.sandbox.connect(ctx.session_id).await {
            Ok(handle) => handle,
            Err(e) => return Ok(format!("Error: {e:#}")),
        };

        let mut contents = Vec::with_capacity(files.len());
        for path in files {
            match handle.read_file(&path).await {
                Ok(content) => contents.push(FileContent { path, content }),
                Err(e) => {
                    warn!("Reading {} failed: {:#}", path, e);
                    return Ok(format!("Error: {e:#}"));
                }
            }
        }
        Ok(serde_json::to_string(&contents)?)
    }
}

//! Sandboxes for isolated code generation.
//!
//! A sandbox is a remote execution environment with a filesystem, a shell and
//! an exposed HTTP port. A run creates one sandbox and reconnects to it by
//! session id for every later operation; each reconnect refreshes the idle
//! timeout that eventually reclaims it.

mod docker;
mod error;
#[cfg(test)]
pub(crate) mod memory;

pub(crate) use docker::DockerSandbox;
pub(crate) use error::SandboxError;

use anyhow::Result;
use async_trait::async_trait;

/// One chunk of streamed command output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OutputChunk<'a> {
    /// Data written to stdout.
    Stdout(&'a str),
    /// Data written to stderr.
    Stderr(&'a str),
}

/// Aggregated result of a command that exited successfully.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

/// Creates, reconnects and releases sandbox sessions.
#[async_trait]
pub(crate) trait SandboxProvider: Send + Sync {
    /// Creates a sandbox from a template and returns its session id.
    async fn create(&self, template: &str) -> Result<String>;

    /// Re-establishes a handle to an existing session and refreshes its idle timeout.
    async fn connect(&self, session_id: &str) -> Result<Box<dyn SandboxHandle>>;

    /// Destroys the session. Releasing a session that is already gone succeeds.
    async fn release(&self, session_id: &str) -> Result<()>;
}

/// A usable connection to one live sandbox session.
#[async_trait]
pub(crate) trait SandboxHandle: Send + Sync {
    /// Runs a shell command, streaming output through `on_output` as it arrives.
    ///
    /// A non-zero exit status is returned as [`SandboxError::CommandFailed`].
    async fn run_command(
        &self,
        command: &str,
        on_output: &mut (dyn for<'c> FnMut(OutputChunk<'c>) + Send),
    ) -> Result<CommandOutput>;

    /// Writes a text file, creating parent directories as needed.
    async fn write_file(&self, path: &str, content: &str) -> Result<()>;

    /// Reads a text file.
    async fn read_file(&self, path: &str) -> Result<String>;

    /// Public URL under which `port` is reachable.
    async fn public_url(&self, port: u16) -> Result<String>;
}

/// Resolves a tool-supplied path against the sandbox working directory.
pub(crate) fn resolve_path(workdir: &str, path: &str) -> String {
    if path.starts_with('/') {
        path.to_string()
    } else {
        format!(
            "{}/{}",
            workdir.trim_end_matches('/'),
            path.trim_start_matches("./")
        )
    }
}

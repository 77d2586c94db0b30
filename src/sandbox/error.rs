//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use std::time::Duration;

/// Errors that can occur during sandbox operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// Docker daemon is not running or not accessible.
    #[error("Docker is not available: {message}")]
    DockerUnavailable { message: String },

    /// Sandbox template image was not found.
    #[error("Sandbox template not found: {template}")]
    TemplateNotFound { template: String },

    /// No live sandbox exists for the session id (never created, or reclaimed by its idle timeout).
    #[error("Sandbox session not found: {session_id}")]
    SessionNotFound { session_id: String },

    /// A command did not finish within the configured timeout.
    #[error("Command timed out after {timeout_secs} seconds")]
    Timeout { timeout_secs: u64 },

    /// A command exited with a non-zero status.
    #[error("Command exited with status {exit_code}")]
    CommandFailed { exit_code: i64 },

    /// The requested port is not published by the sandbox.
    #[error("Port {port} is not exposed by sandbox {session_id}")]
    PortNotExposed { session_id: String, port: u16 },

    /// Filesystem operation inside the sandbox failed.
    #[error("File operation failed for {path}: {message}")]
    FileFailed { path: String, message: String },

    /// Container operation failed (create, start, exec, etc.).
    #[error("Container operation failed: {message}")]
    ContainerFailed { message: String },
}

impl SandboxError {
    /// Creates a `DockerUnavailable` error.
    pub fn docker_unavailable(message: impl Into<String>) -> Self {
        Self::DockerUnavailable {
            message: message.into(),
        }
    }

    /// Creates a `TemplateNotFound` error.
    pub fn template_not_found(template: impl Into<String>) -> Self {
        Self::TemplateNotFound {
            template: template.into(),
        }
    }

    /// Creates a `SessionNotFound` error.
    pub fn session_not_found(session_id: impl Into<String>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Creates a `Timeout` error from a `Duration`.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout {
            timeout_secs: duration.as_secs(),
        }
    }

    /// Creates a `PortNotExposed` error.
    pub fn port_not_exposed(session_id: impl Into<String>, port: u16) -> Self {
        Self::PortNotExposed {
            session_id: session_id.into(),
            port,
        }
    }

    /// Creates a `FileFailed` error.
    pub fn file_failed(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self::FileFailed {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Creates a `ContainerFailed` error.
    pub fn container_failed(message: impl Into<String>) -> Self {
        Self::ContainerFailed {
            message: message.into(),
        }
    }

    /// Returns true if the session no longer exists.
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, Self::SessionNotFound { .. })
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if this is a Docker unavailability error.
    pub fn is_docker_unavailable(&self) -> bool {
        matches!(self, Self::DockerUnavailable { .. })
    }
}

/// Idle timeout expressed in whole seconds, as the sandbox lease expects it.
pub(crate) fn lease_secs(timeout: Duration) -> u64 {
    timeout.as_secs().max(1)
}

//! In-memory sandbox for tests.
//!
//! Keeps files in a map, answers commands from a script and counts lease
//! refreshes so tests can observe idle-timeout behaviour without Docker.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use super::{CommandOutput, OutputChunk, SandboxError, SandboxHandle, SandboxProvider};

/// Scripted reply for a command.
#[derive(Debug, Clone)]
pub(crate) enum CommandReply {
    /// Exit 0 with the given stdout and stderr.
    Success { stdout: String, stderr: String },
    /// Exit non-zero after printing the given output.
    Failure {
        exit_code: i64,
        stdout: String,
        stderr: String,
    },
}

#[derive(Debug, Default)]
struct Session {
    template: String,
    files: BTreeMap<String, String>,
    lease_refreshes: u32,
}

#[derive(Debug, Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    replies: HashMap<String, CommandReply>,
    commands: Vec<String>,
    created: u32,
    released: Vec<String>,
    fail_writes: bool,
}

/// A sandbox provider that never leaves the process.
#[derive(Debug, Clone, Default)]
pub(crate) struct InMemorySandbox {
    inner: Arc<Mutex<Inner>>,
}

impl InMemorySandbox {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts the reply for an exact command string.
    pub fn reply(&self, command: &str, reply: CommandReply) {
        self.inner
            .lock()
            .unwrap()
            .replies
            .insert(command.to_string(), reply);
    }

    /// Makes every subsequent file write fail.
    pub fn fail_writes(&self) {
        self.inner.lock().unwrap().fail_writes = true;
    }

    /// Number of sandboxes created.
    pub fn created_count(&self) -> u32 {
        self.inner.lock().unwrap().created
    }

    /// Session ids released so far.
    pub fn released(&self) -> Vec<String> {
        self.inner.lock().unwrap().released.clone()
    }

    /// Commands executed so far, in order.
    pub fn commands(&self) -> Vec<String> {
        self.inner.lock().unwrap().commands.clone()
    }

    /// How many times the session's idle timeout was refreshed.
    pub fn lease_refreshes(&self, session_id: &str) -> u32 {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .map_or(0, |s| s.lease_refreshes)
    }

    /// Template the session was created from.
    pub fn template_of(&self, session_id: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .map(|s| s.template.clone())
    }

    /// Snapshot of the files written into a session.
    pub fn files(&self, session_id: &str) -> BTreeMap<String, String> {
        self.inner
            .lock()
            .unwrap()
            .sessions
            .get(session_id)
            .map(|s| s.files.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SandboxProvider for InMemorySandbox {
    async fn create(&self, template: &str) -> Result<String> {
        let mut inner = self.inner.lock().unwrap();
        inner.created += 1;
        let id = format!("mem-{}", inner.created);
        inner.sessions.insert(
            id.clone(),
            Session {
                template: template.to_string(),
                ..Default::default()
            },
        );
        Ok(id)
    }

    async fn connect(&self, session_id: &str) -> Result<Box<dyn SandboxHandle>> {
        let mut inner = self.inner.lock().unwrap();
        let session = inner
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SandboxError::session_not_found(session_id))?;
        session.lease_refreshes += 1;
        Ok(Box::new(InMemoryHandle {
            session_id: session_id.to_string(),
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn release(&self, session_id: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        inner.sessions.remove(session_id);
        inner.released.push(session_id.to_string());
        Ok(())
    }
}

struct InMemoryHandle {
    session_id: String,
    inner: Arc<Mutex<Inner>>,
}

#[async_trait]
impl SandboxHandle for InMemoryHandle {
    async fn run_command(
        &self,
        command: &str,
        on_output: &mut (dyn for<'c> FnMut(OutputChunk<'c>) + Send),
    ) -> Result<CommandOutput> {
        let reply = {
            let mut inner = self.inner.lock().unwrap();
            inner.commands.push(command.to_string());
            inner.replies.get(command).cloned()
        };

        match reply {
            None => Ok(CommandOutput::default()),
            Some(CommandReply::Success { stdout, stderr }) => {
                on_output(OutputChunk::Stdout(&stdout));
                on_output(OutputChunk::Stderr(&stderr));
                Ok(CommandOutput {
                    stdout,
                    stderr,
                    exit_code: 0,
                })
            }
            Some(CommandReply::Failure {
                exit_code,
                stdout,
                stderr,
            }) => {
                on_output(OutputChunk::Stdout(&stdout));
                on_output(OutputChunk::Stderr(&stderr));
                Err(SandboxError::CommandFailed { exit_code }.into())
            }
        }
    }

    async fn write_file(&self, path: &str, content: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_writes {
            return Err(SandboxError::file_failed(path, "disk full").into());
        }
        let session = inner
            .sessions
            .get_mut(&self.session_id)
            .ok_or_else(|| SandboxError::session_not_found(&self.session_id))?;
        session.files.insert(path.to_string(), content.to_string());
        Ok(())
    }

    async fn read_file(&self, path: &str) -> Result<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .sessions
            .get(&self.session_id)
            .and_then(|s| s.files.get(path).cloned())
            .ok_or_else(|| SandboxError::file_failed(path, "no such file").into())
    }

    async fn public_url(&self, port: u16) -> Result<String> {
        Ok(format!("https://{port}-{}.sandbox.test", self.session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_reconnect_refreshes_lease_and_handle_is_usable() {
        let sandbox = InMemorySandbox::new();
        let id = sandbox.create("imaginate-dev").await.unwrap();
        assert_eq!(sandbox.lease_refreshes(&id), 0);

        let handle = sandbox.connect(&id).await.unwrap();
        handle.write_file("a.txt", "hello").await.unwrap();
        assert_eq!(sandbox.lease_refreshes(&id), 1);

        let handle = sandbox.connect(&id).await.unwrap();
        assert_eq!(sandbox.lease_refreshes(&id), 2);
        assert_eq!(handle.read_file("a.txt").await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_connect_after_release_fails() {
        let sandbox = InMemorySandbox::new();
        let id = sandbox.create("imaginate-dev").await.unwrap();
        sandbox.release(&id).await.unwrap();

        let err = sandbox.connect(&id).await.err().unwrap();
        assert!(err
            .downcast_ref::<SandboxError>()
            .is_some_and(SandboxError::is_session_not_found));
    }

    #[test]
    fn test_in_memory_sandbox_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<InMemorySandbox>();
    }
}

//! Persistence gateway for conversations and runs.
//!
//! The run engine only talks to the [`ConversationStore`] and [`RunStore`]
//! traits. [`FileStore`] is the bundled implementation:
//!
//! ```text
//! .imaginate/
//!   projects/
//!     {project_id}/
//!       messages.jsonl   # Conversation turns (newline-delimited JSON)
//!   runs/
//!     {run_id}.json      # Run record with its step journal
//! ```

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::state::RunRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub(crate) enum MessageKind {
    Result,
    Error,
}

/// Generated app attached to a successful assistant turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Fragment {
    pub sandbox_url: String,
    pub title: String,
    pub files: BTreeMap<String, String>,
}

/// One immutable entry of a project's conversation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ConversationTurn {
    pub id: Uuid,
    pub project_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fragment: Option<Fragment>,
    pub created_at: DateTime<Utc>,
}

impl ConversationTurn {
    pub fn new(
        project_id: impl Into<String>,
        role: MessageRole,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            role,
            content: content.into(),
            kind,
            fragment: None,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_fragment(mut self, fragment: Fragment) -> Self {
        self.fragment = Some(fragment);
        self
    }
}

/// Conversation storage.
#[async_trait]
pub(crate) trait ConversationStore: Send + Sync {
    /// All turns of a project, oldest first.
    async fn find_many(&self, project_id: &str) -> Result<Vec<ConversationTurn>>;

    /// Appends a turn. A turn whose id is already stored is not written again.
    async fn create(&self, turn: &ConversationTurn) -> Result<()>;
}

/// Run record storage.
#[async_trait]
pub(crate) trait RunStore: Send + Sync {
    async fn save_run(&self, run: &RunRecord) -> Result<()>;

    /// Loads a run, `None` if it does not exist.
    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunRecord>>;

    /// Runs, newest first, optionally limited to one project.
    async fn list_runs(&self, project_id: Option<&str>) -> Result<Vec<RunRecord>>;
}

/// Project ids become directory names, so only a safe alphabet is allowed.
pub(crate) fn validate_project_id(project_id: &str) -> Result<()> {
    if project_id.is_empty() {
        bail!("Project id must not be empty");
    }
    if !project_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("Invalid project id '{project_id}': use letters, digits, '-' and '_' only");
    }
    Ok(())
}

/// JSON file store rooted at the data directory.
#[derive(Debug, Clone)]
pub(crate) struct FileStore {
    base_dir: PathBuf,
}

impl FileStore {
    pub fn new(data_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: data_dir.as_ref().to_path_buf(),
        }
    }

    fn messages_path(&self, project_id: &str) -> PathBuf {
        self.base_dir
            .join("projects")
            .join(project_id)
            .join("messages.jsonl")
    }

    fn runs_dir(&self) -> PathBuf {
        self.base_dir.join("runs")
    }

    fn run_path(&self, run_id: Uuid) -> PathBuf {
        self.runs_dir().join(format!("{run_id}.json"))
    }

    fn read_run(path: &Path) -> Result<RunRecord> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read run record: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run record: {}", path.display()))
    }
}

#[async_trait]
impl ConversationStore for FileStore {
    async fn find_many(&self, project_id: &str) -> Result<Vec<ConversationTurn>> {
        validate_project_id(project_id)?;
        let path = self.messages_path(project_id);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&path)
            .with_context(|| format!("Failed to open messages: {}", path.display()))?;
        let mut turns = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line.with_context(|| format!("Failed to read {}", path.display()))?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ConversationTurn>(&line) {
                Ok(turn) => turns.push(turn),
                Err(e) => warn!(
                    "Skipping unreadable message at {}:{}: {}",
                    path.display(),
                    index + 1,
                    e
                ),
            }
        }

        turns.sort_by_key(|turn| turn.created_at);
        Ok(turns)
    }

    async fn create(&self, turn: &ConversationTurn) -> Result<()> {
        validate_project_id(&turn.project_id)?;
        let path = self.messages_path(&turn.project_id);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        if self.find_many(&turn.project_id).await?.iter().any(|t| t.id == turn.id) {
            debug!("Message {} already stored for {}", turn.id, turn.project_id);
            return Ok(());
        }

        let mut line = serde_json::to_string(turn).context("Failed to serialize message")?;
        line.push('\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| file.write_all(line.as_bytes()))
            .with_context(|| format!("Failed to append message: {}", path.display()))?;

        debug!("Stored {:?} message {} for {}", turn.role, turn.id, turn.project_id);
        Ok(())
    }
}

#[async_trait]
impl RunStore for FileStore {
    async fn save_run(&self, run: &RunRecord) -> Result<()> {
        let dir = self.runs_dir();
        fs::create_dir_all(&dir).with_context(|| format!("Failed to create {}", dir.display()))?;

        let path = self.run_path(run.id);
        let tmp = path.with_extension("json.tmp");
        let content = serde_json::to_string_pretty(run).context("Failed to serialize run")?;
        fs::write(&tmp, content)
            .with_context(|| format!("Failed to write run record: {}", tmp.display()))?;
        fs::rename(&tmp, &path)
            .with_context(|| format!("Failed to replace run record: {}", path.display()))?;
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<Option<RunRecord>> {
        let path = self.run_path(run_id);
        if !path.exists() {
            return Ok(None);
        }
        Self::read_run(&path).map(Some)
    }

    async fn list_runs(&self, project_id: Option<&str>) -> Result<Vec<RunRecord>> {
        let dir = self.runs_dir();
        if !dir.exists() {
            return Ok(Vec::new());
        }

        let mut runs = Vec::new();
        let entries =
            fs::read_dir(&dir).with_context(|| format!("Failed to list {}", dir.display()))?;
        for entry in entries {
            let path = match entry {
                Ok(entry) => entry.path(),
                Err(e) => {
                    warn!("Failed to read directory entry: {}", e);
                    continue;
                }
            };
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match Self::read_run(&path) {
                Ok(run) if project_id.map_or(true, |p| p == run.project_id) => runs.push(run),
                Ok(_) => {}
                Err(e) => warn!("{:#}", e),
            }
        }

        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }
}

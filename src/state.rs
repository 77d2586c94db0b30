use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Generated files keyed by relative path. Last write wins.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub(crate) struct FileSet(BTreeMap<String, String>);

impl FileSet {
    /// Merges `written` into the set, overwriting existing paths.
    pub fn merge(&mut self, written: BTreeMap<String, String>) {
        self.0.extend(written);
    }

    #[cfg(test)]
    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_map(&self) -> &BTreeMap<String, String> {
        &self.0
    }
}

impl From<BTreeMap<String, String>> for FileSet {
    fn from(files: BTreeMap<String, String>) -> Self {
        Self(files)
    }
}

/// Context threaded through every agent turn of one run.
///
/// Tools only ever see `files`; the summary is written by the completion hook.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct AgentState {
    pub files: FileSet,
    summary: Option<String>,
}

impl AgentState {
    pub fn summary(&self) -> Option<&str> {
        self.summary.as_deref()
    }

    /// Records the task summary. The first summary wins; returns false if one
    /// was already recorded.
    pub fn record_summary(&mut self, summary: String) -> bool {
        if self.summary.is_some() {
            return false;
        }
        self.summary = Some(summary);
        true
    }

    /// A run produced a result only when it has both a summary and files.
    pub fn is_complete(&self) -> bool {
        self.summary.as_deref().is_some_and(|s| !s.is_empty()) && !self.files.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// One durable invocation of the code generation workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: Uuid,
    pub project_id: String,
    pub prompt: String,
    pub status: RunStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last infrastructure error; the run can be resumed after it.
    #[serde(default)]
    pub last_error: Option<String>,
    /// Results of completed steps, keyed by step id.
    #[serde(default)]
    pub steps: BTreeMap<String, serde_json::Value>,
}

impl RunRecord {
    pub fn new(project_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            project_id: project_id.into(),
            prompt: prompt.into(),
            status: RunStatus::Pending,
            created_at: now,
            updated_at: now,
            last_error: None,
            steps: BTreeMap::new(),
        }
    }

    /// Moves the run to `status` and stamps the update time.
    pub fn transition(&mut self, status: RunStatus) {
        self.status = status;
        self.updated_at = Utc::now();
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, RunStatus::Succeeded | RunStatus::Failed)
    }
}

//! Step journal for resumable runs.
//!
//! Every named step stores its JSON result in the run record, and the record
//! is saved right after. When a run is resumed, a step that already has a
//! result returns the stored value instead of executing again.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use tracing::debug;

use crate::state::{RunRecord, RunStatus};
use crate::store::RunStore;

pub(crate) struct StepJournal<'a> {
    run: RunRecord,
    store: &'a dyn RunStore,
}

impl<'a> StepJournal<'a> {
    pub fn new(run: RunRecord, store: &'a dyn RunStore) -> Self {
        Self { run, store }
    }

    pub fn run(&self) -> &RunRecord {
        &self.run
    }

    /// Stored result of a completed step, if any.
    pub fn recorded<T: DeserializeOwned>(&self, step_id: &str) -> Result<Option<T>> {
        self.run
            .steps
            .get(step_id)
            .map(|stored| {
                serde_json::from_value(stored.clone())
                    .with_context(|| format!("Stored result of step '{step_id}' is unreadable"))
            })
            .transpose()
    }

    /// Runs `f` once per run; later calls with the same id replay its result.
    pub async fn step<T, F, Fut>(&mut self, step_id: &str, f: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if let Some(stored) = self.recorded(step_id)? {
            debug!("Replaying step '{}'", step_id);
            return Ok(stored);
        }

        tracing::info!(event = "step_start", run_id = %self.run.id, step = step_id);
        let value = f().await.with_context(|| format!("Step '{step_id}' failed"))?;

        let stored = serde_json::to_value(&value)
            .with_context(|| format!("Failed to serialize result of step '{step_id}'"))?;
        self.run.steps.insert(step_id.to_string(), stored);
        self.run.updated_at = Utc::now();
        self.save().await?;
        tracing::info!(event = "step_complete", run_id = %self.run.id, step = step_id);
        Ok(value)
    }

    pub async fn transition(&mut self, status: RunStatus) -> Result<()> {
        self.run.transition(status);
        self.save().await
    }

    /// Records an infrastructure error; the run stays resumable.
    pub async fn record_error(&mut self, error: &anyhow::Error) -> Result<()> {
        self.run.last_error = Some(format!("{error:#}"));
        self.run.updated_at = Utc::now();
        self.save().await
    }

    pub async fn clear_error(&mut self) -> Result<()> {
        if self.run.last_error.take().is_some() {
            self.save().await?;
        }
        Ok(())
    }

    async fn save(&self) -> Result<()> {
        self.store
            .save_run(&self.run)
            .await
            .with_context(|| format!("Failed to persist run {}", self.run.id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::FileStore;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_step_executes_once_and_persists() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let mut journal = StepJournal::new(RunRecord::new("p", "x"), &store);
        let mut calls = 0;

        let first: String = journal
            .step("get-sandbox-id", || {
                calls += 1;
                async { Ok("mem-1".to_string()) }
            })
            .await
            .unwrap();
        let second: String = journal
            .step("get-sandbox-id", || {
                calls += 1;
                async { Ok("mem-2".to_string()) }
            })
            .await
            .unwrap();

        assert_eq!(first, "mem-1");
        assert_eq!(second, "mem-1");
        assert_eq!(calls, 1);
        assert_eq!(
            journal.recorded::<String>("get-sandbox-id").unwrap().as_deref(),
            Some("mem-1")
        );

        let saved = store.load_run(journal.run().id).await.unwrap().unwrap();
        assert_eq!(saved.steps["get-sandbox-id"], "mem-1");
    }

    #[tokio::test]
    async fn test_failed_step_is_not_recorded() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let mut journal = StepJournal::new(RunRecord::new("p", "x"), &store);

        let result: Result<String> = journal
            .step("get-sandbox-url", || async { Err(anyhow::anyhow!("port closed")) })
            .await;

        let err = result.unwrap_err();
        assert!(format!("{err:#}").contains("Step 'get-sandbox-url' failed: port closed"));
        assert!(journal.recorded::<String>("get-sandbox-url").unwrap().is_none());

        journal.record_error(&err).await.unwrap();
        let saved = store.load_run(journal.run().id).await.unwrap().unwrap();
        assert!(saved.last_error.unwrap().contains("port closed"));

        journal.clear_error().await.unwrap();
        assert!(journal.run().last_error.is_none());
    }

    #[tokio::test]
    async fn test_resumed_journal_replays_stored_steps() {
        let dir = TempDir::new().unwrap();
        let store = FileStore::new(dir.path());
        let mut run = RunRecord::new("p", "x");
        run.steps
            .insert("get-previous-messages".to_string(), serde_json::json!(["a", "b"]));
        let mut journal = StepJournal::new(run, &store);

        let replayed: Vec<String> = journal
            .step("get-previous-messages", || async { Err(anyhow::anyhow!("must not run")) })
            .await
            .unwrap();
        assert_eq!(replayed, vec!["a", "b"]);
    }
}

use anyhow::{bail, Result};
use uuid::Uuid;

use super::format::{format_run_detail, format_run_list};
use super::Workspace;
use crate::coordinator::saved_output;
use crate::store::RunStore;

/// Lists recent runs, or shows one run in detail.
pub async fn run(workspace: &Workspace, run_id: Option<Uuid>) -> Result<()> {
    let store = workspace.store();

    match run_id {
        Some(run_id) => {
            let Some(run) = store.load_run(run_id).await? else {
                bail!("Run {run_id} not found");
            };
            let output = saved_output(&run)?;
            print!("{}", format_run_detail(&run, output.as_ref()));
        }
        None => {
            let runs = store.list_runs(None).await?;
            print!("{}", format_run_list(&runs));
        }
    }

    Ok(())
}

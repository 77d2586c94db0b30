use anyhow::Result;

use super::format::format_history;
use super::Workspace;
use crate::store::ConversationStore;

/// Prints a project's conversation, oldest turn first.
pub async fn run(workspace: &Workspace, project_id: &str) -> Result<()> {
    let turns = workspace.store().find_many(project_id).await?;
    print!("{}", format_history(project_id, &turns));
    Ok(())
}

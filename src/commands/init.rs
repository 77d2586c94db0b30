//! Write the default configuration into a project directory.
//!
//! The core logic takes closures for filesystem access so it can be tested
//! without touching disk.

use anyhow::{Context, Result};
use colored::Colorize;
use std::fmt::Write;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::config::CONFIG_FILE;
use crate::templates;

/// Runs the init command.
pub(crate) fn run(force: bool) -> Result<()> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    info!("Initializing imaginate in {}", cwd.display());

    let files = init_files();
    let results = init_project(
        &files,
        force,
        |path| cwd.join(path).exists(),
        |path, content| {
            fs::write(cwd.join(path), content)
                .with_context(|| format!("Failed to write {}", path.display()))
        },
    )?;

    print!("{}", format_results(&results, &files));
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct InitFile {
    path: PathBuf,
    content: &'static str,
    description: &'static str,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteResult {
    Created,
    Overwritten,
    Skipped,
}

fn init_files() -> Vec<InitFile> {
    vec![InitFile {
        path: PathBuf::from(CONFIG_FILE),
        content: templates::IMAGINATE_TOML,
        description: "Model, sandbox and store configuration",
    }]
}

/// Writes each file unless it exists and `force` is off.
fn init_project<E, W>(
    files: &[InitFile],
    force: bool,
    exists: E,
    mut write_file: W,
) -> Result<Vec<(PathBuf, WriteResult)>>
where
    E: Fn(&Path) -> bool,
    W: FnMut(&Path, &str) -> Result<()>,
{
    let mut results = Vec::with_capacity(files.len());
    for file in files {
        let existed = exists(&file.path);
        let result = match (existed, force) {
            (true, false) => WriteResult::Skipped,
            (true, true) => {
                write_file(&file.path, file.content)?;
                WriteResult::Overwritten
            }
            (false, _) => {
                write_file(&file.path, file.content)?;
                WriteResult::Created
            }
        };
        results.push((file.path.clone(), result));
    }
    Ok(results)
}

fn format_results(results: &[(PathBuf, WriteResult)], files: &[InitFile]) -> String {
    let mut out = String::new();

    let _ = writeln!(out, "\n{} imaginate initialized\n", "✓".green().bold());
    for (path, result) in results {
        let desc = files
            .iter()
            .find(|f| &f.path == path)
            .map_or("", |f| f.description);
        let _ = match result {
            WriteResult::Created => {
                writeln!(out, "  {} - {}", path.display().to_string().cyan(), desc)
            }
            WriteResult::Overwritten => {
                writeln!(out, "  {} {} (overwritten)", "↻".blue(), path.display())
            }
            WriteResult::Skipped => writeln!(
                out,
                "  {} {} (already exists, use --force to overwrite)",
                "⊘".yellow(),
                path.display()
            ),
        };
    }

    let _ = writeln!(out, "\n{}", "Next steps:".yellow().bold());
    let _ = writeln!(
        out,
        "  1. Export {} (or point model.api_base at a compatible server)",
        "OPENAI_API_KEY".cyan()
    );
    let _ = writeln!(
        out,
        "  2. Make sure the sandbox template image in {} exists locally",
        CONFIG_FILE.cyan()
    );
    let _ = writeln!(
        out,
        "  3. Run {}",
        "imaginate run \"build a todo app\"".green()
    );
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    #[test]
    fn test_init_files_contain_config() {
        let files = init_files();
        assert!(files.iter().any(|f| f.path == Path::new("imaginate.toml")));
        assert!(files.iter().all(|f| !f.content.is_empty()));
    }

    #[test]
    fn test_init_project_creates_missing_files() {
        let files = init_files();
        let written = RefCell::new(HashMap::new());

        let results = init_project(&files, false, |_| false, |path, content| {
            written
                .borrow_mut()
                .insert(path.to_path_buf(), content.to_string());
            Ok(())
        })
        .unwrap();

        assert!(results.iter().all(|(_, r)| *r == WriteResult::Created));
        assert_eq!(written.borrow().len(), files.len());
    }

    #[test]
    fn test_init_project_skips_existing_without_force() {
        let files = init_files();
        let mut writes = 0;

        let results = init_project(&files, false, |_| true, |_, _| {
            writes += 1;
            Ok(())
        })
        .unwrap();

        assert!(results.iter().all(|(_, r)| *r == WriteResult::Skipped));
        assert_eq!(writes, 0);
    }

    #[test]
    fn test_init_project_overwrites_with_force() {
        let files = init_files();
        let results = init_project(&files, true, |_| true, |_, _| Ok(())).unwrap();
        assert!(results.iter().all(|(_, r)| *r == WriteResult::Overwritten));
    }

    #[test]
    fn test_format_results() {
        let files = init_files();
        let created = format_results(&[(PathBuf::from(CONFIG_FILE), WriteResult::Created)], &files);
        assert!(created.contains("imaginate initialized"));
        assert!(created.contains("imaginate.toml"));
        assert!(created.contains("Next steps"));

        let skipped = format_results(&[(PathBuf::from(CONFIG_FILE), WriteResult::Skipped)], &files);
        assert!(skipped.contains("already exists"));
        assert!(skipped.contains("--force"));
    }
}

//! CLI command implementations.
//!
//! Each submodule implements one imaginate command. Formatting lives in
//! [`format`] as pure functions so output can be tested without IO.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::store::FileStore;

pub mod format;
pub mod history;
pub mod init;
pub mod run;
pub mod status;

/// Configuration and data directory resolved for the current directory.
pub(crate) struct Workspace {
    pub config: Config,
    pub data_dir: PathBuf,
}

impl Workspace {
    /// Loads `imaginate.toml` (or `config_path`) relative to the current directory.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let cwd = std::env::current_dir().context("Failed to get current directory")?;
        Self::load_from(&cwd, config_path)
    }

    fn load_from(dir: &Path, config_path: Option<&Path>) -> Result<Self> {
        let config = Config::load(dir, config_path)?;
        let data_dir = config.store.resolve_data_dir(dir)?;
        Ok(Self { config, data_dir })
    }

    pub fn store(&self) -> FileStore {
        FileStore::new(&self.data_dir)
    }
}

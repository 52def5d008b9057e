use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    state_dir: PathBuf,
}

impl StateLayout {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.state_dir.join("ledger.json")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir.join("ledger.lock")
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.state_dir.join("backups")
    }

    pub fn tmp_dir(&self) -> PathBuf {
        self.state_dir.join("tmp")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [self.state_dir.clone(), self.backups_dir(), self.tmp_dir()] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

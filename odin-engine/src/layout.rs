//! Where everything lives under a project root.

use std::io;
use std::path::{Path, PathBuf};

pub const ODIN_DIR: &str = ".odin";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    root: PathBuf,
}

impl Layout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn odin_dir(&self) -> PathBuf {
        self.root.join(ODIN_DIR)
    }

    pub fn backups_dir(&self) -> PathBuf {
        self.odin_dir().join("backups")
    }

    pub fn checkpoints_dir(&self) -> PathBuf {
        self.odin_dir().join("checkpoints")
    }

    pub fn audit_dir(&self) -> PathBuf {
        self.odin_dir().join("audit")
    }

    pub fn state_file(&self) -> PathBuf {
        self.odin_dir().join(crate::state::state_file::STATE_FILE_NAME)
    }

    pub fn config_file(&self) -> PathBuf {
        self.odin_dir().join("config.toml")
    }

    pub fn audit_report(&self) -> PathBuf {
        self.odin_dir().join("audit_report.md")
    }

    /// Path of a backup record relative to the root, as stored in the state
    pub fn backup_ref(&self, file_name: &str) -> String {
        format!("{ODIN_DIR}/backups/{file_name}")
    }

    /// Create the state directories. Existing content is left alone.
    pub fn ensure_scaffold(&self) -> io::Result<()> {
        for dir in [self.backups_dir(), self.checkpoints_dir(), self.audit_dir()] {
            std::fs::create_dir_all(dir)?;
        }
        Ok(())
    }
}

//! File metadata carried through the archive.
//!
//! Permissions and modification time go into each tar header so a restore
//! reproduces executable bits as well as content.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::SystemTime;

const DEFAULT_MODE: u32 = 0o644;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMetadata {
    /// File size in bytes
    pub size: u64,

    /// Last modified time (seconds since Unix epoch)
    pub modified: u64,

    /// File permissions (Unix mode bits)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,
}

impl FileMetadata {
    /// Extract metadata from a file path (following symlinks)
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let metadata = fs::metadata(path)?;

        let modified = metadata
            .modified()?
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();

        #[cfg(unix)]
        let permissions = {
            use std::os::unix::fs::PermissionsExt;
            Some(metadata.permissions().mode() & 0o7777)
        };

        #[cfg(not(unix))]
        let permissions = None;

        Ok(Self {
            size: metadata.len(),
            modified,
            permissions,
        })
    }

    /// Mode to record in an archive header
    pub fn mode(&self) -> u32 {
        self.permissions.unwrap_or(DEFAULT_MODE)
    }

    /// Apply the recorded permissions to a restored file
    #[cfg(unix)]
    pub fn apply_mode(path: &Path, mode: u32) -> std::io::Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))
    }

    #[cfg(not(unix))]
    pub fn apply_mode(_path: &Path, _mode: u32) -> std::io::Result<()> {
        // On non-Unix platforms only the content is restored
        Ok(())
    }
}

//! The single predicate deciding which files a backup covers.
//!
//! The same policy drives the archive, the record's snapshot, the combined
//! project hash and mirror deletion, so the four can never disagree about
//! what "a tracked file" is.

use crate::config::{ArchiveConfig, IntegrityConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InclusionPolicy {
    /// Lowercase extensions without the leading dot
    pub extensions: BTreeSet<String>,

    /// Exact file names included regardless of extension
    pub file_names: BTreeSet<String>,

    /// Path components that exclude a file wherever they appear
    pub excluded_names: BTreeSet<String>,

    /// Larger files are skipped
    pub max_file_size: u64,
}

impl InclusionPolicy {
    pub fn from_config(integrity: &IntegrityConfig, archive: &ArchiveConfig) -> Self {
        Self {
            extensions: archive.extensions.clone(),
            file_names: archive.file_names.clone(),
            excluded_names: integrity.ignore_names.clone(),
            max_file_size: archive.max_file_size,
        }
    }

    /// True when a path (POSIX, relative to the root) lies under an excluded
    /// component. Used on its own when restoring from an archive.
    pub fn is_excluded(&self, relative: &str) -> bool {
        relative
            .split('/')
            .any(|part| self.excluded_names.contains(part))
    }

    /// Full predicate for a regular file of `size` bytes.
    pub fn includes(&self, relative: &str, size: u64) -> bool {
        if self.is_excluded(relative) || size > self.max_file_size {
            return false;
        }

        let name = relative.rsplit('/').next().unwrap_or(relative);
        if self.file_names.contains(name) {
            return true;
        }

        Path::new(name)
            .extension()
            .map(|ext| self.extensions.contains(&ext.to_string_lossy().to_lowercase()))
            .unwrap_or(false)
    }
}

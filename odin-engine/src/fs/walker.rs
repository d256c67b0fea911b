//! Directory traversal for snapshots, archives and mirror restores.
//!
//! Entries are visited in lexicographic order so every consumer sees the same
//! sequence for an unchanged tree. Unreadable entries are skipped with a
//! warning; only an unreadable root is an error.

use crate::fs::inclusion::InclusionPolicy;
use crate::utils::fsutil::to_posix;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::warn;
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Entry names (directories or files) that are never visited
    pub ignore_names: BTreeSet<String>,

    /// When set, only files accepted by the policy are returned
    pub inclusion: Option<InclusionPolicy>,
}

impl WalkOptions {
    pub fn ignoring(ignore_names: BTreeSet<String>) -> Self {
        Self {
            ignore_names,
            inclusion: None,
        }
    }

    pub fn with_policy(policy: InclusionPolicy) -> Self {
        Self {
            ignore_names: policy.excluded_names.clone(),
            inclusion: Some(policy),
        }
    }
}

/// Information about a file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// POSIX path relative to the root
    pub relative_path: String,

    /// File size in bytes (of the target, for symlinks)
    pub size: u64,

    /// Is this a symlink?
    pub is_symlink: bool,
}

impl FileInfo {
    /// Create FileInfo from a DirEntry.
    /// Symlinks are resolved so their target is treated as an opaque byte
    /// source. Returns None for directories, special files and dangling links.
    fn from_entry(entry: &DirEntry, root: &Path) -> Option<Self> {
        let path = entry.path().to_path_buf();
        let relative = path.strip_prefix(root).unwrap_or(&path);
        let relative_path = to_posix(relative);
        let is_symlink = entry.path_is_symlink();

        let metadata = match std::fs::metadata(&path) {
            Ok(m) => m,
            Err(e) => {
                warn!("Skipping unreadable entry {}: {}", relative_path, e);
                return None;
            }
        };

        if metadata.is_dir() {
            return None;
        }

        if !metadata.is_file() {
            warn!("Skipping special file {}", relative_path);
            return None;
        }

        Some(Self {
            path,
            relative_path,
            size: metadata.len(),
            is_symlink,
        })
    }
}

/// Walk a project tree and collect every file that passes the options.
///
/// # Returns
/// * `Ok(Vec<FileInfo>)` - Files sorted by relative path
/// * `Err(io::Error)` - If the root itself cannot be read
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_directory_with_callback(root, options, |file| files.push(file))?;
    Ok(files)
}

/// Walk a project tree with a callback for each accepted file
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(FileInfo),
{
    std::fs::read_dir(root)?;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !should_exclude(e, &options.ignore_names));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Walk error under {}: {}", root.display(), e);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        let Some(file_info) = FileInfo::from_entry(&entry, root) else {
            continue;
        };

        if let Some(policy) = &options.inclusion {
            if !policy.includes(&file_info.relative_path, file_info.size) {
                continue;
            }
        }

        callback(file_info);
    }

    Ok(())
}

/// Check if a directory entry should be excluded by exact name
fn should_exclude(entry: &DirEntry, ignore_names: &BTreeSet<String>) -> bool {
    ignore_names.contains(entry.file_name().to_string_lossy().as_ref())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ArchiveConfig, IntegrityConfig};
    use std::fs;
    use tempfile::TempDir;

    fn default_options() -> WalkOptions {
        WalkOptions::ignoring(IntegrityConfig::default().ignore_names)
    }

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &default_options())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_sorted_posix_paths() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("b.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/a.txt"), b"content2")?;
        fs::write(temp_dir.path().join("a.txt"), b"content3")?;

        let files = walk_directory(temp_dir.path(), &default_options())?;
        let paths: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["a.txt", "b.txt", "subdir/a.txt"]);

        Ok(())
    }

    #[test]
    fn test_ignored_directories_are_pruned() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir_all(temp_dir.path().join(".git/objects"))?;
        fs::create_dir_all(temp_dir.path().join(".odin/backups"))?;
        fs::write(temp_dir.path().join(".git/objects/x"), b"obj")?;
        fs::write(temp_dir.path().join(".odin/backups/b.json"), b"{}")?;
        fs::write(temp_dir.path().join("keep.py"), b"x = 1")?;
        // Exact-name matching: a file merely containing an ignored name stays.
        fs::write(temp_dir.path().join("my.git.notes"), b"n")?;

        let files = walk_directory(temp_dir.path(), &default_options())?;
        let paths: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["keep.py", "my.git.notes"]);

        Ok(())
    }

    #[test]
    fn test_inclusion_policy_filters_files() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("main.py"), b"print(1)")?;
        fs::write(temp_dir.path().join("image.png"), [0u8, 1, 2])?;
        fs::write(temp_dir.path().join("Makefile"), b"all:")?;

        let policy =
            InclusionPolicy::from_config(&IntegrityConfig::default(), &ArchiveConfig::default());
        let files = walk_directory(temp_dir.path(), &WalkOptions::with_policy(policy))?;
        let paths: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["Makefile", "main.py"]);

        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_symlinks_resolved_and_dangling_skipped() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("target.txt"), b"data")?;
        std::os::unix::fs::symlink("target.txt", temp_dir.path().join("link.txt"))?;
        std::os::unix::fs::symlink("missing.txt", temp_dir.path().join("dangling.txt"))?;

        let files = walk_directory(temp_dir.path(), &default_options())?;
        let paths: Vec<_> = files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(paths, vec!["link.txt", "target.txt"]);
        assert!(files[0].is_symlink);
        assert_eq!(files[0].size, 4);

        Ok(())
    }

    #[test]
    fn test_missing_root_is_error() {
        let temp_dir = TempDir::new().unwrap();
        assert!(walk_directory(&temp_dir.path().join("nope"), &default_options()).is_err());
    }
}

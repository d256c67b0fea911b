//! Filesystem helpers for crash-safe writes.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Write data to a file atomically using temp-file-then-rename.
///
/// The temp file lives next to the target so the rename never crosses a
/// filesystem boundary. Until the rename succeeds nothing is visible under
/// `path`; on any failure the temp file is removed.
pub fn atomic_write(path: &Path, data: &[u8]) -> io::Result<()> {
    atomic_write_with(path, data, |from, to| fs::rename(from, to))
}

/// Same as [`atomic_write`] with a caller-supplied rename step.
pub fn atomic_write_with<F>(path: &Path, data: &[u8], rename: F) -> io::Result<()>
where
    F: FnOnce(&Path, &Path) -> io::Result<()>,
{
    let tmp = temp_path_for(path);

    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(data)?;
        file.sync_data()?;
        drop(file);
        rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }

    result
}

/// Temp sibling used while `path` is being written.
pub fn temp_path_for(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "odin".to_string());
    path.with_file_name(format!(".{}.{}.tmp", name, std::process::id()))
}

/// Convert a path relative to the project root into its POSIX form.
pub fn to_posix(relative: &Path) -> String {
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_atomic_write_creates_file() -> io::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("record.json");

        atomic_write(&target, b"{}")?;

        assert_eq!(fs::read(&target)?, b"{}");
        assert!(!temp_path_for(&target).exists());
        Ok(())
    }

    #[test]
    fn test_failed_rename_leaves_nothing_visible() -> io::Result<()> {
        let dir = TempDir::new()?;
        let target = dir.path().join("backup_x.bak.json");

        let result = atomic_write_with(&target, b"payload", |_, _| {
            Err(io::Error::new(io::ErrorKind::Other, "simulated crash"))
        });

        assert!(result.is_err());
        assert!(!target.exists());
        assert_eq!(fs::read_dir(dir.path())?.count(), 0);
        Ok(())
    }

    #[test]
    fn test_to_posix() {
        let rel = Path::new("src").join("nested").join("main.py");
        assert_eq!(to_posix(&rel), "src/nested/main.py");
    }
}

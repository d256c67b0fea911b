//! Working-tree archive embedded in backup records.
//!
//! Format: a tar stream (one regular-file entry per included file, with its
//! Unix mode and mtime in the header), compressed with zstd and base64-encoded
//! so it can sit inside the JSON record.

use crate::fs::inclusion::InclusionPolicy;
use crate::fs::metadata::FileMetadata;
use crate::fs::walker::FileInfo;
use crate::utils::fsutil::atomic_write;
use base64::{engine::general_purpose::STANDARD, Engine};
use std::collections::BTreeSet;
use std::fs;
use std::io::{self, Read};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

pub const COMPRESSION: &str = "tar+zstd+base64";

/// Encoded archive plus what went into it.
#[derive(Debug)]
pub struct BuiltArchive {
    pub encoded: String,
    pub paths: Vec<String>,
    /// Files that were selected but could not be read or stored
    pub skipped: Vec<String>,
}

#[derive(Debug, Default)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    /// Entries left alone because they fall under excluded paths
    pub excluded: Vec<String>,
    /// One message per entry that could not be restored
    pub errors: Vec<String>,
}

/// Archive `files` (already filtered by the inclusion policy).
pub fn build(files: &[FileInfo], compression_level: i32) -> io::Result<BuiltArchive> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut paths = Vec::with_capacity(files.len());
    let mut skipped = Vec::new();

    for file in files {
        let data = match fs::read(&file.path) {
            Ok(data) => data,
            Err(e) => {
                warn!("Leaving {} out of the archive: {}", file.relative_path, e);
                skipped.push(file.relative_path.clone());
                continue;
            }
        };
        let metadata = FileMetadata::from_path(&file.path).ok();

        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Regular);
        header.set_size(data.len() as u64);
        header.set_mode(metadata.as_ref().map_or(0o644, FileMetadata::mode));
        header.set_mtime(metadata.as_ref().map_or(0, |m| m.modified));
        // append_data writes a GNU long-name entry for paths over 100 bytes
        // and fills in the checksum.
        if let Err(e) = builder.append_data(&mut header, &file.relative_path, data.as_slice()) {
            warn!("Leaving {} out of the archive: {}", file.relative_path, e);
            skipped.push(file.relative_path.clone());
            continue;
        }

        paths.push(file.relative_path.clone());
    }

    let tar_bytes = builder.into_inner()?;
    let compressed = zstd::encode_all(tar_bytes.as_slice(), compression_level)?;
    debug!(
        "Archive: {} files, {} bytes tar, {} bytes compressed",
        paths.len(),
        tar_bytes.len(),
        compressed.len()
    );

    Ok(BuiltArchive {
        encoded: STANDARD.encode(compressed),
        paths,
        skipped,
    })
}

fn decode(encoded: &str) -> io::Result<Vec<u8>> {
    let compressed = STANDARD
        .decode(encoded.trim())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    zstd::decode_all(compressed.as_slice())
}

/// Paths of the regular-file entries in an encoded archive.
pub fn list_paths(encoded: &str) -> io::Result<BTreeSet<String>> {
    let tar_bytes = decode(encoded)?;
    let mut archive = tar::Archive::new(tar_bytes.as_slice());
    let mut paths = BTreeSet::new();
    for entry in archive.entries()? {
        let entry = entry?;
        if entry.header().entry_type().is_file() {
            paths.insert(entry.path()?.to_string_lossy().replace('\\', "/"));
        }
    }
    Ok(paths)
}

/// Extract an encoded archive over `root`.
///
/// Only fails when the archive itself cannot be decoded; a bad entry is
/// recorded in the report and extraction carries on. Entries with absolute
/// paths or `..` components are rejected, entries under excluded names are
/// skipped, and each file is written to a temp sibling and renamed into place.
pub fn restore(encoded: &str, root: &Path, policy: &InclusionPolicy) -> io::Result<RestoreReport> {
    let tar_bytes = decode(encoded)?;
    let mut archive = tar::Archive::new(tar_bytes.as_slice());
    let mut report = RestoreReport::default();

    for entry in archive.entries()? {
        let mut entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                report.errors.push(format!("corrupt archive entry: {e}"));
                // The stream position is unknown after a bad header.
                break;
            }
        };

        if !entry.header().entry_type().is_file() {
            continue;
        }

        let raw_path = match entry.path() {
            Ok(path) => path.into_owned(),
            Err(e) => {
                report.errors.push(format!("unreadable entry path: {e}"));
                continue;
            }
        };

        let relative = match sanitize_entry_path(&raw_path) {
            Some(relative) => relative,
            None => {
                warn!("Rejecting archive entry outside the root: {}", raw_path.display());
                report
                    .errors
                    .push(format!("{}: path escapes the project root", raw_path.display()));
                continue;
            }
        };

        if policy.is_excluded(&relative) {
            report.excluded.push(relative);
            continue;
        }

        let mode = entry.header().mode().ok();
        let mut data = Vec::with_capacity(entry.size() as usize);
        if let Err(e) = entry.read_to_end(&mut data) {
            report.errors.push(format!("{relative}: {e}"));
            continue;
        }

        match write_restored(root, &relative, &data, mode) {
            Ok(()) => report.restored.push(relative),
            Err(e) => {
                warn!("Failed to restore {}: {}", relative, e);
                report.errors.push(format!("{relative}: {e}"));
            }
        }
    }

    Ok(report)
}

/// POSIX relative form of an entry path, or None if it is absolute or
/// climbs out of the root.
fn sanitize_entry_path(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn write_restored(root: &Path, relative: &str, data: &[u8], mode: Option<u32>) -> io::Result<()> {
    let mut target = root.to_path_buf();
    let parts: Vec<&str> = relative.split('/').collect();

    // Refuse to follow a symlinked directory out of the root.
    for part in &parts[..parts.len() - 1] {
        target.push(part);
        if let Ok(meta) = fs::symlink_metadata(&target) {
            if meta.file_type().is_symlink() {
                return Err(io::Error::other(format!(
                    "parent {} is a symlink",
                    target.display()
                )));
            }
        }
    }
    fs::create_dir_all(&target)?;

    let target: PathBuf = target.join(parts[parts.len() - 1]);
    atomic_write(&target, data)?;
    if let Some(mode) = mode {
        FileMetadata::apply_mode(&target, mode)?;
    }
    Ok(())
}

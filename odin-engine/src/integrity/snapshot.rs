//! Project snapshots: a `path -> hash` map built from one walk of the tree.

use super::hasher::{sha256_hex, ContentHasher};
use crate::fs::walker::{walk_directory, FileInfo, WalkOptions};
use crate::utils::errors::IntegrityError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, warn};

/// Immutable `relative_path -> hash` map. Keys are POSIX paths.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot(BTreeMap<String, String>);

impl Snapshot {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, path: &str) -> Option<&str> {
        self.0.get(path).map(String::as_str)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.0.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(p, h)| (p.as_str(), h.as_str()))
    }
}

impl FromIterator<(String, String)> for Snapshot {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

impl From<BTreeMap<String, String>> for Snapshot {
    fn from(map: BTreeMap<String, String>) -> Self {
        Self(map)
    }
}

/// Partition of the union of two snapshots' paths. Each list is sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriftReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub modified: Vec<String>,
    pub unchanged: Vec<String>,
}

impl DriftReport {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty())
    }

    /// Number of drifted paths (added + removed + modified)
    pub fn changed_count(&self) -> usize {
        self.added.len() + self.removed.len() + self.modified.len()
    }
}

/// Compare two snapshots. Pure; no I/O.
pub fn diff(old: &Snapshot, new: &Snapshot) -> DriftReport {
    let mut report = DriftReport::default();

    for (path, old_hash) in &old.0 {
        match new.0.get(path) {
            None => report.removed.push(path.clone()),
            Some(new_hash) if new_hash != old_hash => report.modified.push(path.clone()),
            Some(_) => report.unchanged.push(path.clone()),
        }
    }
    report.added = new
        .0
        .keys()
        .filter(|path| !old.0.contains_key(*path))
        .cloned()
        .collect();

    report
}

/// Single fingerprint for a project state: SHA-256 over the sorted
/// `path:hash` pairs.
pub fn combined_hash(snapshot: &Snapshot) -> String {
    // BTreeMap iteration is already sorted by path.
    let joined: String = snapshot
        .0
        .iter()
        .map(|(path, hash)| format!("{path}:{hash}"))
        .collect();
    sha256_hex(joined.as_bytes())
}

/// Builds snapshots of a project tree.
#[derive(Clone)]
pub struct SnapshotIndex {
    hasher: ContentHasher,
    options: WalkOptions,
    threads: usize,
}

impl SnapshotIndex {
    pub fn new(hasher: ContentHasher, options: WalkOptions) -> Self {
        Self {
            hasher,
            options,
            threads: 1,
        }
    }

    /// Convenience constructor: walk everything except `ignore_names`.
    pub fn ignoring(hasher: ContentHasher, ignore_names: BTreeSet<String>) -> Self {
        Self::new(hasher, WalkOptions::ignoring(ignore_names))
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    pub fn options(&self) -> &WalkOptions {
        &self.options
    }

    /// Walk `root` and hash every accepted file.
    ///
    /// Files that vanish or cannot be read between the walk and the hash are
    /// left out with a warning. The result does not depend on the thread
    /// count.
    pub fn build(&self, root: &Path) -> Result<Snapshot, IntegrityError> {
        if !root.is_dir() {
            return Err(IntegrityError::InvalidRoot(root.to_path_buf()));
        }

        let files = walk_directory(root, &self.options).map_err(|e| IntegrityError::Walk {
            root: root.to_path_buf(),
            message: e.to_string(),
        })?;

        let hashed = if self.threads <= 1 || files.len() < 2 {
            hash_files(&self.hasher, &files)
        } else {
            let chunk_size = files.len().div_ceil(self.threads);
            std::thread::scope(|scope| {
                let handles: Vec<_> = files
                    .chunks(chunk_size)
                    .map(|chunk| scope.spawn(|| hash_files(&self.hasher, chunk)))
                    .collect();

                let mut all = Vec::with_capacity(files.len());
                for handle in handles {
                    match handle.join() {
                        Ok(part) => all.extend(part),
                        Err(_) => warn!("Hash worker panicked; its files are missing from the snapshot"),
                    }
                }
                all
            })
        };

        let snapshot: Snapshot = hashed.into_iter().collect();
        debug!(
            "Snapshot of {} built: {} files",
            root.display(),
            snapshot.len()
        );
        Ok(snapshot)
    }
}

fn hash_files(hasher: &ContentHasher, files: &[FileInfo]) -> Vec<(String, String)> {
    files
        .iter()
        .filter_map(|file| match std::fs::read(&file.path) {
            Ok(bytes) => {
                let hash = hasher.hash(&file.path, &bytes);
                Some((file.relative_path.clone(), hash))
            }
            Err(e) => {
                warn!("Cannot read {} for hashing: {}", file.relative_path, e);
                None
            }
        })
        .collect()
}

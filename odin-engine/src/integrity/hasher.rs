//! Content hashing using SHA-256.

use super::normalizer::NormalizerRegistry;
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Compute the SHA-256 hash of arbitrary bytes, returned as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Hashes file content, normalizing it first when a normalizer is
/// registered for the file's extension.
///
/// Never fails: unknown extensions and content a normalizer rejects are
/// hashed as raw bytes.
#[derive(Clone)]
pub struct ContentHasher {
    registry: Arc<NormalizerRegistry>,
    semantic: bool,
}

impl ContentHasher {
    pub fn new(registry: NormalizerRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            semantic: true,
        }
    }

    /// Hasher with the built-in normalizers registered
    pub fn semantic() -> Self {
        Self::new(NormalizerRegistry::with_defaults())
    }

    /// Hasher that ignores normalizers entirely (binary integrity)
    pub fn raw() -> Self {
        Self {
            registry: Arc::new(NormalizerRegistry::empty()),
            semantic: false,
        }
    }

    pub fn is_semantic(&self) -> bool {
        self.semantic
    }

    pub fn hash(&self, path: &Path, bytes: &[u8]) -> String {
        if self.semantic {
            if let Some(normalizer) = self.registry.for_path(path) {
                match normalizer.try_normalize(bytes) {
                    Some(normalized) => return sha256_hex(&normalized),
                    None => debug!(
                        "{} normalizer rejected {}, hashing raw bytes",
                        normalizer.name(),
                        path.display()
                    ),
                }
            }
        }

        sha256_hex(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_deterministic() {
        assert_eq!(sha256_hex(b"hello world"), sha256_hex(b"hello world"));
        assert_ne!(sha256_hex(b"hello"), sha256_hex(b"world"));
    }

    #[test]
    fn test_hash_length() {
        let h = sha256_hex(b"test");
        assert_eq!(h.len(), 64);
        assert!(h.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn test_comment_edit_keeps_semantic_hash() {
        let hasher = ContentHasher::semantic();
        let path = Path::new("a.py");
        let before = b"x=1\n# note\n";
        let after = b"x=1\n# other note\n";

        assert_eq!(hasher.hash(path, before), hasher.hash(path, after));
        assert_ne!(sha256_hex(before), sha256_hex(after));
    }

    #[test]
    fn test_raw_hasher_sees_comment_edits() {
        let hasher = ContentHasher::raw();
        assert!(!hasher.is_semantic());
        let path = Path::new("a.py");
        assert_ne!(
            hasher.hash(path, b"x=1\n# note\n"),
            hasher.hash(path, b"x=1\n# other note\n")
        );
    }

    #[test]
    fn test_unknown_extension_hashes_raw_bytes() {
        let hasher = ContentHasher::semantic();
        let bytes = b"\x00\x01binary";
        assert_eq!(hasher.hash(Path::new("blob.bin"), bytes), sha256_hex(bytes));
    }

    #[test]
    fn test_unparseable_python_falls_back_to_raw() {
        let hasher = ContentHasher::semantic();
        let bytes = b"def broken(:\n";
        assert_eq!(hasher.hash(Path::new("bad.py"), bytes), sha256_hex(bytes));
    }
}

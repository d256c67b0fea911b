//! Semantic integrity hashing (SIH) and drift detection.
//!
//! Leaf first: [`hasher`] turns bytes into SHA-256 hex, [`normalizer`] strips
//! non-structural variation before hashing, [`snapshot`] walks a project into
//! a `path -> hash` map and diffs two maps, and [`monitor`] keeps a baseline
//! to check drift against.

pub mod hasher;
pub mod monitor;
pub mod normalizer;
pub mod snapshot;

pub use hasher::{sha256_hex, ContentHasher};
pub use monitor::IntegrityMonitor;
pub use normalizer::{NormalizerRegistry, SemanticNormalizer};
pub use snapshot::{combined_hash, diff, DriftReport, Snapshot, SnapshotIndex};

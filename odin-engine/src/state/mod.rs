//! Caller-owned state: the state file and the checkpoint store.

pub mod checkpoint;
pub mod state_file;

pub use checkpoint::{Checkpoint, CheckpointKind, CheckpointStore};
pub use state_file::{context_signature, IntegrityHashes, StateFile};

//! Project tree traversal and file metadata.

pub mod inclusion;
pub mod metadata;
pub mod walker;

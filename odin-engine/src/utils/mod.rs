//! Utility modules shared by every component.

pub mod errors;
pub mod fsutil;
pub mod ids;
pub mod logger;

pub use errors::{OdinError, Result};

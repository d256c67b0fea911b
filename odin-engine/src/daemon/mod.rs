//! Process-level coordination: the instance lock and signal handling.

pub mod lock;
pub mod shutdown;

pub use lock::{acquire, LockGuard, LockOptions};
pub use shutdown::{ShutdownCoordinator, ShutdownSignal};

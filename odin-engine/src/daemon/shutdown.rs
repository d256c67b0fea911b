//! SIGTERM / SIGINT handling for the CLI.
//!
//! Mutating operations cannot be cancelled mid-flight. When a signal arrives
//! the running command is allowed to finish, after which its instance lock
//! guard is dropped and the process exits non-zero.

use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownSignal {
    Interrupt,
    Terminate,
}

/// Listens for SIGINT and SIGTERM from the moment it is created.
pub struct ShutdownCoordinator {
    interrupt: Signal,
    terminate: Signal,
}

impl ShutdownCoordinator {
    /// Install the handlers. Must be called inside a Tokio runtime.
    pub fn new() -> std::io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
        })
    }

    /// Wait for the next SIGINT or SIGTERM.
    pub async fn wait_for_signal(&mut self) -> ShutdownSignal {
        let received = tokio::select! {
            _ = self.interrupt.recv() => ShutdownSignal::Interrupt,
            _ = self.terminate.recv() => ShutdownSignal::Terminate,
        };

        match received {
            ShutdownSignal::Interrupt => {
                info!("Received SIGINT (Ctrl+C), finishing the current operation before exit")
            }
            ShutdownSignal::Terminate => {
                info!("Received SIGTERM, finishing the current operation before exit")
            }
        }
        received
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{raise, Signal as NixSignal};
    use std::time::Duration;

    #[tokio::test]
    async fn test_sigterm_is_caught_and_reported() {
        let mut coordinator = ShutdownCoordinator::new().unwrap();
        raise(NixSignal::SIGTERM).unwrap();

        let received = tokio::time::timeout(Duration::from_secs(5), coordinator.wait_for_signal())
            .await
            .unwrap();
        assert_eq!(received, ShutdownSignal::Terminate);
    }
}

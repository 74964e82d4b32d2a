//! Operator interrupts.
//!
//! SIGINT, SIGTERM and SIGQUIT cancel the running build. Subprocesses then
//! get SIGTERM (and SIGKILL after a grace period) through the runner. A second
//! signal exits immediately, even while reports are still being written.

use crate::result::EXIT_CANCELLED;
use tokio::signal::unix::{Signal, SignalKind, signal};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Handlers for the signals that stop a build.
#[derive(Debug)]
pub struct ShutdownSignals {
    sigint: Signal,
    sigterm: Signal,
    sigquit: Signal,
}

impl ShutdownSignals {
    /// Install the handlers. Must be called from within a tokio runtime.
    pub fn install() -> std::io::Result<Self> {
        Ok(Self {
            sigint: signal(SignalKind::interrupt())?,
            sigterm: signal(SignalKind::terminate())?,
            sigquit: signal(SignalKind::quit())?,
        })
    }

    /// Name of the next signal received.
    pub async fn recv(&mut self) -> &'static str {
        tokio::select! {
            _ = self.sigint.recv() => "SIGINT",
            _ = self.sigterm.recv() => "SIGTERM",
            _ = self.sigquit.recv() => "SIGQUIT",
        }
    }
}

/// Cancel `token` on the first interrupt and exit the process on the second.
///
/// Handlers are installed before this returns. The listener lives until the
/// process exits; abort the handle only to hand signals back.
pub fn cancel_on_signal(token: CancellationToken) -> std::io::Result<JoinHandle<()>> {
    let mut signals = ShutdownSignals::install()?;
    Ok(tokio::spawn(async move {
        let first = signals.recv().await;
        warn!(signal = first, "Interrupted, stopping build (repeat to exit now)");
        token.cancel();

        let second = signals.recv().await;
        error!(signal = second, "Interrupted again, exiting");
        std::process::exit(EXIT_CANCELLED);
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{Signal as NixSignal, raise};
    use std::time::Duration;

    #[tokio::test]
    async fn test_first_signal_cancels_and_listener_stays() {
        let token = CancellationToken::new();
        let listener = cancel_on_signal(token.clone()).unwrap();

        raise(NixSignal::SIGQUIT).unwrap();
        tokio::time::timeout(Duration::from_secs(5), token.cancelled())
            .await
            .unwrap();

        tokio::task::yield_now().await;
        assert!(!listener.is_finished());
        listener.abort();
    }
}

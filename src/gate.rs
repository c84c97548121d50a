//! Exit gate: the timer that guarantees forced termination.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Single-shot timer, armed at most once and cancelled only by [`ExitGate::disarm`]
#[derive(Debug, Default)]
pub(crate) struct ExitGate {
    armed: Mutex<Option<CancellationToken>>,
}

impl ExitGate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Arm the gate unless it already is. Returns whether this call armed it.
    pub(crate) fn arm<F>(&self, runtime: &Handle, timeout: Duration, on_expire: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let mut armed = self.armed.lock();
        if armed.is_some() {
            return false;
        }

        let cancel = CancellationToken::new();
        let cancelled = cancel.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = cancelled.cancelled() => {
                    debug!("Exit gate disarmed");
                }
                _ = tokio::time::sleep(timeout) => {
                    warn!("Exit gate expired after {:?}", timeout);
                    on_expire();
                }
            }
        });

        debug!("Exit gate armed for {:?}", timeout);
        *armed = Some(cancel);
        true
    }

    /// Cancel a pending timer. The gate stays spent and cannot be re-armed.
    pub(crate) fn disarm(&self) {
        if let Some(cancel) = self.armed.lock().as_ref() {
            cancel.cancel();
        }
    }
}

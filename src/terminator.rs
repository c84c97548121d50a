//! The real termination primitive and its stand-ins.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::info;

/// Ends the process with an exit code
pub trait Terminator: Send + Sync {
    fn terminate(&self, code: i32);
}

/// Calls [`std::process::exit`]
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessTerminator;

impl Terminator for ProcessTerminator {
    fn terminate(&self, code: i32) {
        info!("Terminating process with exit code {}", code);
        std::process::exit(code)
    }
}

/// Records termination requests instead of acting on them.
///
/// Useful when the process must outlive its manager, as in tests.
#[derive(Debug, Default)]
pub struct CapturingTerminator {
    codes: Mutex<Vec<i32>>,
    notify: Notify,
}

impl CapturingTerminator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every code passed to [`Terminator::terminate`], oldest first
    pub fn codes(&self) -> Vec<i32> {
        self.codes.lock().clone()
    }

    /// The first recorded code, if any
    pub fn code(&self) -> Option<i32> {
        self.codes.lock().first().copied()
    }

    /// Wait for the first termination, giving up after `limit`
    pub async fn wait(&self, limit: Duration) -> Option<i32> {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();

        if let Some(code) = self.code() {
            return Some(code);
        }

        tokio::time::timeout(limit, notified).await.ok()?;
        self.code()
    }
}

impl Terminator for CapturingTerminator {
    fn terminate(&self, code: i32) {
        self.codes.lock().push(code);
        self.notify.notify_waiters();
    }
}

//! The escape marker returned by intercepted exit requests.
//!
//! An intercepted `exit` cannot terminate the process on the spot, because the
//! shutdown still has asynchronous work to do. Code after the call must not run
//! either. [`ProcessExit`] is how the caller abandons its current path: return it
//! with `?` (it converts into [`crate::ExitingError::Exit`]) or, from a
//! synchronous stack that cannot return an error, call [`ProcessExit::abandon`].
//!
//! It is control flow, not a failure. Code that catches errors generically around
//! an exit request must check [`is_escape`] and let the marker through.

use std::error::Error;
use thiserror::Error;

/// Shutdown has been scheduled; abandon the current call stack.
#[must_use = "return the marker or abandon the stack; code after an exit request must not run"]
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("process exit requested with code {code}")]
pub struct ProcessExit {
    code: i32,
}

impl ProcessExit {
    pub fn new(code: i32) -> Self {
        Self { code }
    }

    /// The exit code that was requested
    pub fn code(&self) -> i32 {
        self.code
    }

    /// Unwind the current thread with the marker as panic payload.
    ///
    /// The panic hook installed by an active manager recognises the payload and
    /// stays silent, so this never counts as an uncaught exception.
    pub fn abandon(self) -> ! {
        std::panic::panic_any(self)
    }
}

/// Whether `err` is the escape marker, either bare or wrapped in [`crate::ExitingError`]
pub fn is_escape(err: &(dyn Error + 'static)) -> bool {
    if err.downcast_ref::<ProcessExit>().is_some() {
        return true;
    }

    matches!(
        err.downcast_ref::<crate::ExitingError>(),
        Some(crate::ExitingError::Exit(_))
    )
}

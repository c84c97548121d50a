//! The context a manager registers itself in.
//!
//! A registry owns the single manager slot, the count of signal handlers per
//! signal and the real termination primitive. [`ExitRegistry::global`] is the
//! process-wide instance the free functions [`exit`] and [`reset`] use; isolated
//! registries from [`ExitRegistry::new`] let several managers coexist, one per
//! registry.

use crate::error::{ExitingError, Result};
use crate::escape::ProcessExit;
use crate::manager::Manager;
use crate::terminator::{ProcessTerminator, Terminator};
use crate::triggers::{self, Signal};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;
use uuid::Uuid;

static GLOBAL_REGISTRY: OnceLock<Arc<ExitRegistry>> = OnceLock::new();

pub struct ExitRegistry {
    slot: Mutex<Option<Manager>>,
    signal_listeners: Mutex<HashMap<Signal, usize>>,
    terminator: Arc<dyn Terminator>,
}

impl ExitRegistry {
    /// A registry that terminates through [`std::process::exit`]
    pub fn new() -> Arc<Self> {
        Self::with_terminator(Arc::new(ProcessTerminator))
    }

    pub fn with_terminator(terminator: Arc<dyn Terminator>) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(None),
            signal_listeners: Mutex::new(HashMap::new()),
            terminator,
        })
    }

    /// The process-wide registry
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(Self::new))
    }

    pub(crate) fn register(&self, manager: &Manager) -> Result<()> {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return Err(ExitingError::AlreadyActive);
        }

        debug!("Registered manager {}", manager.id());
        *slot = Some(manager.clone());
        Ok(())
    }

    /// Free the slot if `id` still holds it
    pub(crate) fn release(&self, id: Uuid) {
        let mut slot = self.slot.lock();
        if slot.as_ref().is_some_and(|manager| manager.id() == id) {
            debug!("Released manager {}", id);
            *slot = None;
        }
    }

    /// The registered manager, if any
    pub fn current(&self) -> Option<Manager> {
        self.slot.lock().clone()
    }

    /// Deactivate whatever manager is registered. No-op when the slot is empty.
    pub fn reset(&self) {
        let current = self.slot.lock().take();
        if let Some(manager) = current {
            manager.deactivate();
        }
    }

    /// Request process termination.
    ///
    /// With an active manager the request is intercepted: the exit path starts
    /// in the background and the returned [`ProcessExit`] must be propagated so
    /// the caller's remaining code does not run. Without one, the real
    /// termination primitive is invoked.
    pub fn exit(&self, code: i32) -> ProcessExit {
        match self.current() {
            Some(manager) if manager.is_active() => manager.exit(code),
            _ => {
                self.terminator.terminate(code);
                ProcessExit::new(code)
            }
        }
    }

    /// Announce a host-installed handler for `signal`.
    ///
    /// While any such guard is alive the manager leaves that signal alone. Once
    /// no guard for a signal is left in any registry, a signal the manager has
    /// listened for before falls back to its default action.
    pub fn listen(self: &Arc<Self>, signal: Signal) -> SignalListenerGuard {
        *self.signal_listeners.lock().entry(signal).or_insert(0) += 1;
        triggers::attend(signal);
        SignalListenerGuard {
            registry: Arc::clone(self),
            signal,
        }
    }

    /// Number of live handlers for `signal`, the manager's own included
    pub fn listener_count(&self, signal: Signal) -> usize {
        self.signal_listeners
            .lock()
            .get(&signal)
            .copied()
            .unwrap_or(0)
    }

    pub(crate) fn terminator(&self) -> Arc<dyn Terminator> {
        Arc::clone(&self.terminator)
    }
}

/// Keeps a signal handler counted in its registry until dropped
pub struct SignalListenerGuard {
    registry: Arc<ExitRegistry>,
    signal: Signal,
}

impl SignalListenerGuard {
    pub fn signal(&self) -> Signal {
        self.signal
    }
}

impl Drop for SignalListenerGuard {
    fn drop(&mut self) {
        let mut listeners = self.registry.signal_listeners.lock();
        if let Some(count) = listeners.get_mut(&self.signal) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                listeners.remove(&self.signal);
            }
        }
        triggers::leave(self.signal);
    }
}

/// Request process termination through the global registry.
///
/// See [`ExitRegistry::exit`].
pub fn exit(code: i32) -> ProcessExit {
    ExitRegistry::global().exit(code)
}

/// Deactivate the manager registered in the global registry, if any
pub fn reset() {
    ExitRegistry::global().reset()
}

//! Shutdown triggers.
//!
//! ```text
//!   OS signal ──────────┐
//!   panic hook ─────────┤
//!   Manager::spawn Err ─┼──> ManagerInner ──> request_exit(code)
//!   listener closed ────┤
//!   exit(code) ─────────┘
//! ```
//!
//! The router owns everything installed on the manager's behalf and tears it
//! down as one unit when the manager deactivates.

mod panic;
mod signals;

pub use signals::Signal;
pub(crate) use signals::{attend, leave};

use crate::error::Result;
use crate::manager::ManagerInner;
use crate::registry::{ExitRegistry, SignalListenerGuard};
use crate::server::ListenerHandle;
use self::panic::PanicInterceptor;
use std::fmt;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Origin of an uncaught error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnhandledKind {
    /// A panic escaped to the panic hook
    Exception,
    /// A failed background task nobody observed
    Rejection,
}

impl fmt::Display for UnhandledKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnhandledKind::Exception => write!(f, "exception"),
            UnhandledKind::Rejection => write!(f, "rejection"),
        }
    }
}

pub(crate) struct TriggerRouter {
    cancel: CancellationToken,
    signal_guards: Vec<SignalListenerGuard>,
    panic_hook: Option<PanicInterceptor>,
}

impl TriggerRouter {
    pub(crate) fn install(
        manager: &Arc<ManagerInner>,
        registry: &Arc<ExitRegistry>,
        runtime: &Handle,
        os_signals: bool,
        catch_panics: bool,
    ) -> Result<Self> {
        let mut router = Self {
            cancel: CancellationToken::new(),
            signal_guards: Vec::with_capacity(Signal::ALL.len()),
            panic_hook: None,
        };

        for signal in Signal::ALL {
            router.signal_guards.push(registry.listen(signal));

            if os_signals {
                if let Err(e) = signals::spawn_listener(
                    signal,
                    Arc::downgrade(manager),
                    runtime,
                    router.cancel.clone(),
                ) {
                    router.uninstall();
                    return Err(e);
                }
            }
        }

        if catch_panics {
            router.panic_hook = Some(PanicInterceptor::install(Arc::downgrade(manager)));
        }

        debug!(
            "Triggers installed (os_signals: {}, catch_panics: {})",
            os_signals, catch_panics
        );
        Ok(router)
    }

    /// Report `listener` closing to the manager, unless the router is torn down first
    pub(crate) fn watch_listener(
        &self,
        listener: ListenerHandle,
        manager: Weak<ManagerInner>,
        runtime: &Handle,
    ) {
        let cancel = self.cancel.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = listener.closed() => {
                    if let Some(manager) = manager.upgrade() {
                        manager.on_listener_closed();
                    }
                }
            }
        });
    }

    pub(crate) fn uninstall(self) {
        self.cancel.cancel();
        if let Some(hook) = self.panic_hook {
            hook.uninstall();
        }
        drop(self.signal_guards);
        debug!("Triggers removed");
    }
}

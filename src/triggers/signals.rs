use crate::manager::ManagerInner;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[cfg(unix)]
use crate::error::ExitingError;
use crate::error::Result;

/// OS signals a manager reacts to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    Interrupt,
    Terminate,
    Quit,
}

impl Signal {
    pub const ALL: [Signal; 3] = [Signal::Interrupt, Signal::Terminate, Signal::Quit];

    /// Code requested when the signal triggers an exit
    pub fn exit_code(&self) -> i32 {
        match self {
            Signal::Interrupt | Signal::Terminate => 0,
            Signal::Quit => 1,
        }
    }

    pub fn is_graceful(&self) -> bool {
        self.exit_code() == 0
    }

    pub fn name(&self) -> &'static str {
        match self {
            Signal::Interrupt => "SIGINT",
            Signal::Terminate => "SIGTERM",
            Signal::Quit => "SIGQUIT",
        }
    }

    fn index(&self) -> usize {
        match self {
            Signal::Interrupt => 0,
            Signal::Terminate => 1,
            Signal::Quit => 2,
        }
    }

    #[cfg(unix)]
    fn raw(&self) -> std::ffi::c_int {
        use signal_hook::consts::{SIGINT, SIGQUIT, SIGTERM};

        match self {
            Signal::Interrupt => SIGINT,
            Signal::Terminate => SIGTERM,
            Signal::Quit => SIGQUIT,
        }
    }

    #[cfg(unix)]
    fn kind(&self) -> tokio::signal::unix::SignalKind {
        use tokio::signal::unix::SignalKind;

        match self {
            Signal::Interrupt => SignalKind::interrupt(),
            Signal::Terminate => SignalKind::terminate(),
            Signal::Quit => SignalKind::quit(),
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Live handlers per signal, summed over every registry in the process
struct Attendance {
    listeners: Mutex<[usize; 3]>,
    unattended: [Arc<AtomicBool>; 3],
    #[cfg(unix)]
    fallback: Mutex<[bool; 3]>,
}

fn attendance() -> &'static Attendance {
    static ATTENDANCE: OnceLock<Attendance> = OnceLock::new();
    ATTENDANCE.get_or_init(|| Attendance {
        listeners: Mutex::new([0; 3]),
        unattended: std::array::from_fn(|_| Arc::new(AtomicBool::new(true))),
        #[cfg(unix)]
        fallback: Mutex::new([false; 3]),
    })
}

/// Count a live handler for `signal`
pub(crate) fn attend(signal: Signal) {
    let attendance = attendance();
    let mut listeners = attendance.listeners.lock();
    listeners[signal.index()] += 1;
    attendance.unattended[signal.index()].store(false, Ordering::SeqCst);
}

/// Drop a handler counted by [`attend`]
pub(crate) fn leave(signal: Signal) {
    let attendance = attendance();
    let mut listeners = attendance.listeners.lock();
    let count = &mut listeners[signal.index()];
    *count = count.saturating_sub(1);
    if *count == 0 {
        attendance.unattended[signal.index()].store(true, Ordering::SeqCst);
    }
}

/// Run the default action for `signal` whenever it arrives with no handler counted.
///
/// The runtime's own handler stays registered for the life of the process.
#[cfg(unix)]
fn install_fallback(signal: Signal) -> Result<()> {
    let attendance = attendance();
    let mut installed = attendance.fallback.lock();
    if installed[signal.index()] {
        return Ok(());
    }

    signal_hook::flag::register_conditional_default(
        signal.raw(),
        Arc::clone(&attendance.unattended[signal.index()]),
    )
    .map_err(ExitingError::SignalInstall)?;

    installed[signal.index()] = true;
    debug!("Default action restored for unattended {}", signal);
    Ok(())
}

#[cfg(unix)]
pub(super) fn spawn_listener(
    signal: Signal,
    manager: Weak<ManagerInner>,
    runtime: &Handle,
    cancel: CancellationToken,
) -> Result<()> {
    install_fallback(signal)?;

    // Registration needs a reactor, and install may run from a sync context
    let _guard = runtime.enter();
    let mut stream =
        tokio::signal::unix::signal(signal.kind()).map_err(ExitingError::SignalInstall)?;

    runtime.spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stopped listening for {}", signal);
                    break;
                }
                received = stream.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("Received {}", signal);
                    match manager.upgrade() {
                        Some(manager) => manager.on_signal(signal),
                        None => break,
                    }
                }
            }
        }
    });

    Ok(())
}

#[cfg(not(unix))]
pub(super) fn spawn_listener(
    signal: Signal,
    manager: Weak<ManagerInner>,
    runtime: &Handle,
    cancel: CancellationToken,
) -> Result<()> {
    if signal != Signal::Interrupt {
        return Ok(());
    }

    runtime.spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Stopped listening for {}", signal);
                    break;
                }
                received = tokio::signal::ctrl_c() => {
                    if received.is_err() {
                        break;
                    }
                    info!("Received {}", signal);
                    match manager.upgrade() {
                        Some(manager) => manager.on_signal(signal),
                        None => break,
                    }
                }
            }
        }
    });

    Ok(())
}

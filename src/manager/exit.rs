use super::orchestrator::{Manager, ManagerInner};
use super::types::describe;
use super::ExitState;
use crate::error::{BoxError, ExitingError};
use crate::escape::{is_escape, ProcessExit};
use crate::server::{ExtHandler, ExtPoint, StopOptions};
use crate::triggers::{Signal, UnhandledKind};
use futures::FutureExt;
use std::error::Error;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Code used when the exit gate expires or a listener closes unexpectedly
pub const SEVERE_EXIT_CODE: i32 = 255;

/// Code used for uncaught errors
pub const ABORT_EXIT_CODE: i32 = 1;

enum ExitAction {
    Wait,
    BeginStop(Handle),
    Terminate(i32),
}

impl ManagerInner {
    /// Central exit request. `None` re-evaluates the state without raising the code.
    pub(super) fn request_exit(self: &Arc<Self>, code: Option<i32>) {
        let action = {
            let mut shared = self.shared.lock();
            if !shared.active {
                return;
            }

            if let Some(code) = code {
                shared.exit_code = shared.exit_code.max(code);
                shared.exit_requested = true;
            }

            let Some(runtime) = shared.runtime.clone() else {
                return;
            };
            self.arm_gate(&runtime);

            match shared.state {
                None | Some(ExitState::StartAborted) | Some(ExitState::Stopping) => {
                    ExitAction::Wait
                }
                Some(ExitState::Starting) => {
                    shared.state = Some(ExitState::StartAborted);
                    ExitAction::Wait
                }
                Some(ExitState::Started) => {
                    shared.state = Some(ExitState::Stopping);
                    ExitAction::BeginStop(runtime)
                }
                Some(ExitState::Prestopped) => {
                    if shared.exit_code == 0 {
                        ExitAction::Wait
                    } else {
                        shared.state = Some(ExitState::Errored);
                        ExitAction::Terminate(shared.exit_code)
                    }
                }
                Some(ExitState::Stopped) | Some(ExitState::Errored) | Some(ExitState::Timeout) => {
                    ExitAction::Terminate(shared.exit_code)
                }
            }
        };

        match action {
            ExitAction::Wait => {}
            ExitAction::BeginStop(runtime) => self.begin_stop(&runtime),
            ExitAction::Terminate(code) => self.force_exit(code),
        }
    }

    fn arm_gate(self: &Arc<Self>, runtime: &Handle) {
        let manager = Arc::downgrade(self);
        self.gate.arm(runtime, self.options.exit_timeout, move || {
            if let Some(manager) = manager.upgrade() {
                manager.on_timeout();
            }
        });
    }

    fn begin_stop(self: &Arc<Self>, runtime: &Handle) {
        info!("Stopping {} server(s)", self.servers.len());

        for server in &self.servers {
            server.ext(ExtPoint::PreStop, self.pre_stop_handler());
        }

        let manager = Arc::clone(self);
        let options = StopOptions {
            timeout: self.options.stop_timeout(),
        };
        runtime.spawn(async move {
            if let Err(e) = manager.stop_servers(options).await {
                let cause: &(dyn Error + 'static) = e.source().unwrap_or(&e);
                manager.log(&format!("Server stop failed: {}", cause));
            }
            manager.request_exit(None);
        });
    }

    fn pre_stop_handler(self: &Arc<Self>) -> ExtHandler {
        let manager = Arc::downgrade(self);
        let fired = Arc::new(AtomicBool::new(false));

        Arc::new(move || {
            let manager = manager.clone();
            let first = !fired.swap(true, Ordering::SeqCst);
            async move {
                match manager.upgrade() {
                    Some(manager) if first => manager.on_pre_stop(),
                    _ => Ok(()),
                }
            }
            .boxed()
        })
    }

    fn on_pre_stop(&self) -> Result<(), BoxError> {
        let mut shared = self.shared.lock();
        if !shared.active {
            return Ok(());
        }

        if shared.state == Some(ExitState::Stopping) {
            shared.state = Some(ExitState::Prestopped);
        }

        if shared.exit_code != 0 {
            return Err(Box::new(ExitingError::ProcessAborted));
        }
        Ok(())
    }

    fn on_timeout(self: &Arc<Self>) {
        {
            let mut shared = self.shared.lock();
            if !shared.active || shared.terminated {
                return;
            }
            warn!(
                "Exit timed out after {:?} in state {}",
                self.options.exit_timeout,
                describe(shared.state)
            );
            shared.state = Some(ExitState::Timeout);
        }

        self.request_exit(Some(SEVERE_EXIT_CODE));
    }

    fn force_exit(&self, code: i32) {
        {
            let mut shared = self.shared.lock();
            if shared.terminated {
                return;
            }
            shared.terminated = true;
        }

        info!("Exiting with code {}", code);
        self.terminator.terminate(code);
    }

    pub(crate) fn on_signal(self: &Arc<Self>, signal: Signal) {
        if !self.shared.lock().active {
            return;
        }

        let listeners = self.registry.listener_count(signal);
        if listeners != 1 {
            debug!(
                "Ignoring {}: {} handlers are installed for it",
                signal, listeners
            );
            return;
        }

        self.request_exit(Some(signal.exit_code()));
    }

    pub(crate) fn unhandled_error(self: &Arc<Self>, kind: UnhandledKind, message: &str) {
        {
            let mut shared = self.shared.lock();
            if !shared.active {
                return;
            }
            if shared.state == Some(ExitState::Stopping) {
                shared.state = Some(ExitState::Errored);
            }
        }

        error!("Fatal {}: {}", kind, message);
        self.log(&format!("Fatal {}: {}", kind, message));
        self.request_exit(Some(ABORT_EXIT_CODE));
    }

    pub(crate) fn on_listener_closed(self: &Arc<Self>) {
        {
            let shared = self.shared.lock();
            if !shared.active || shared.state != Some(ExitState::Started) {
                return;
            }
        }

        warn!("Server listener closed unexpectedly");
        self.request_exit(Some(SEVERE_EXIT_CODE));
    }

    pub(super) fn log(&self, message: &str) {
        (self.options.log)(message);
    }
}

impl Manager {
    /// Begin the exit path with `code` and hand back the escape marker.
    ///
    /// Ignored once the manager is deactivated.
    pub fn exit(&self, code: i32) -> ProcessExit {
        self.inner.request_exit(Some(code));
        ProcessExit::new(code)
    }

    /// Report an error no task observed. The escape marker is let through silently.
    pub fn report_rejection(&self, err: BoxError) {
        if is_escape(err.as_ref()) {
            return;
        }
        self.inner
            .unhandled_error(UnhandledKind::Rejection, &err.to_string());
    }

    /// Spawn a background task whose failure counts as an unhandled rejection
    pub fn spawn<F, E>(&self, future: F) -> JoinHandle<()>
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        let manager = Arc::downgrade(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = future.await {
                if let Some(inner) = manager.upgrade() {
                    Manager { inner }.report_rejection(e.into());
                }
            }
        })
    }

    /// Call when the host process is about to exit on its own
    pub fn before_exit(&self) {
        let state = {
            let shared = self.inner.shared.lock();
            if !shared.active || shared.state.is_some_and(|state| state.is_terminal()) {
                return;
            }
            shared.state
        };

        self.inner.log(&format!(
            "Process exiting without stopping servers (state == {})",
            describe(state)
        ));
    }
}

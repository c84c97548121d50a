use super::orchestrator::Manager;
use super::types::describe;
use super::ExitState;
use crate::error::{BoxError, ExitingError, Result};
use crate::escape::ProcessExit;
use crate::server::{Server, ServerSet, StopOptions};
use crate::triggers::TriggerRouter;
use futures::future::join_all;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

enum StartOutcome {
    Started,
    Escaped(ProcessExit),
    Failed(BoxError),
}

/// Bookkeeping while servers start concurrently
#[derive(Default)]
struct StartupTracker {
    failed: bool,
    error: Option<BoxError>,
    escape: Option<ProcessExit>,
    running: Vec<Arc<dyn Server>>,
}

impl Manager {
    /// Install the triggers and start every server.
    ///
    /// If any server fails, the ones that did start are stopped again and the
    /// first failure is returned. An exit requested while starting is honoured
    /// as soon as startup settles.
    pub async fn start(&self) -> Result<()> {
        let runtime = Handle::current();
        {
            let mut shared = self.inner.shared.lock();
            if shared.deactivated {
                return Err(ExitingError::invalid_state("start", "deactivated"));
            }
            if shared.state.is_some() {
                return Err(ExitingError::invalid_state("start", describe(shared.state)));
            }
            shared.state = Some(ExitState::Starting);
            shared.active = true;
            shared.runtime = Some(runtime.clone());
        }

        info!("Starting {} server(s)", self.inner.servers.len());

        let router = match TriggerRouter::install(
            &self.inner,
            &self.inner.registry,
            &runtime,
            self.inner.options.os_signals,
            self.inner.options.catch_panics,
        ) {
            Ok(router) => router,
            Err(e) => {
                error!("Failed to install shutdown triggers: {}", e);
                let mut shared = self.inner.shared.lock();
                shared.state = Some(ExitState::Errored);
                shared.active = false;
                return Err(e);
            }
        };
        self.inner.shared.lock().router = Some(router);

        let stop_options = StopOptions {
            timeout: self.inner.options.stop_timeout(),
        };
        let outcome = start_all(&self.inner.servers, stop_options).await;

        let aborted = {
            let mut shared = self.inner.shared.lock();
            let aborted = shared.state == Some(ExitState::StartAborted);
            if matches!(
                shared.state,
                Some(ExitState::Starting) | Some(ExitState::StartAborted)
            ) {
                shared.state = Some(match outcome {
                    StartOutcome::Failed(_) => ExitState::Errored,
                    _ => ExitState::Started,
                });
            }
            aborted
        };

        match outcome {
            StartOutcome::Started => {
                info!("All servers started");
                if aborted {
                    self.inner.request_exit(None);
                } else {
                    self.watch_listeners();
                }
                Ok(())
            }
            StartOutcome::Escaped(escape) => {
                debug!("Startup escaped with exit code {}", escape.code());
                self.inner.request_exit(Some(escape.code()));
                Err(ExitingError::Exit(escape))
            }
            StartOutcome::Failed(e) => {
                error!("Startup failed: {}", e);
                if aborted {
                    self.inner.request_exit(None);
                }
                Err(ExitingError::Startup(e))
            }
        }
    }

    fn watch_listeners(&self) {
        let shared = self.inner.shared.lock();
        let (Some(router), Some(runtime)) = (shared.router.as_ref(), shared.runtime.as_ref())
        else {
            return;
        };

        for server in &self.inner.servers {
            router.watch_listener(server.listener(), Arc::downgrade(&self.inner), runtime);
        }
    }
}

/// Start all servers concurrently, rolling back the started ones on the first failure
async fn start_all(servers: &ServerSet, stop_options: StopOptions) -> StartOutcome {
    let tracker = parking_lot::Mutex::new(StartupTracker::default());

    join_all(servers.iter().map(|server| {
        let tracker = &tracker;
        async move {
            match server.start().await {
                Ok(()) => {
                    debug!("Server {} started", server.name());
                    let rollback = {
                        let mut tracker = tracker.lock();
                        if tracker.failed {
                            true
                        } else {
                            tracker.running.push(Arc::clone(server));
                            false
                        }
                    };
                    if rollback {
                        safe_stop(server, stop_options).await;
                    }
                }
                Err(e) => {
                    if let Some(escape) = escape_of(&e) {
                        tracker.lock().escape.get_or_insert(escape);
                        return;
                    }

                    warn!("Server {} failed to start: {}", server.name(), e);
                    let running = {
                        let mut tracker = tracker.lock();
                        tracker.failed = true;
                        if tracker.error.is_none() {
                            tracker.error = Some(e);
                        }
                        std::mem::take(&mut tracker.running)
                    };

                    safe_stop(server, stop_options).await;
                    join_all(running.iter().map(|other| safe_stop(other, stop_options))).await;
                }
            }
        }
    }))
    .await;

    let tracker = tracker.into_inner();
    match (tracker.error, tracker.escape) {
        (Some(e), _) => StartOutcome::Failed(e),
        (None, Some(escape)) => StartOutcome::Escaped(escape),
        (None, None) => StartOutcome::Started,
    }
}

async fn safe_stop(server: &Arc<dyn Server>, options: StopOptions) {
    if let Err(e) = server.stop(options).await {
        warn!("Ignoring stop failure of {} during rollback: {}", server.name(), e);
    }
}

fn escape_of(err: &BoxError) -> Option<ProcessExit> {
    if let Some(escape) = err.downcast_ref::<ProcessExit>() {
        return Some(*escape);
    }
    match err.downcast_ref::<ExitingError>() {
        Some(ExitingError::Exit(escape)) => Some(*escape),
        _ => None,
    }
}


use super::orchestrator::{Manager, ManagerInner};
use super::types::describe;
use super::ExitState;
use crate::error::{BoxError, ExitingError, Result};
use crate::server::StopOptions;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{info, warn};

impl Manager {
    /// Stop every server with the default grace period
    pub async fn stop(&self) -> Result<()> {
        self.stop_with(StopOptions::default()).await
    }

    /// Stop every server.
    ///
    /// Only valid once started. An exit requested while the stop runs resumes
    /// as soon as it completes.
    pub async fn stop_with(&self, options: StopOptions) -> Result<()> {
        {
            let mut shared = self.inner.shared.lock();
            if shared.state != Some(ExitState::Started) {
                return Err(ExitingError::invalid_state("stop", describe(shared.state)));
            }
            shared.state = Some(ExitState::Stopping);
        }

        let result = self.inner.stop_servers(options).await;

        let resume = {
            let shared = self.inner.shared.lock();
            shared.active && shared.exit_requested
        };
        if resume {
            self.inner.request_exit(None);
        }

        result
    }
}

impl ManagerInner {
    /// Stop all servers concurrently, waiting for every one of them
    pub(super) async fn stop_servers(&self, options: StopOptions) -> Result<()> {
        let mut stops: FuturesUnordered<_> = self
            .servers
            .iter()
            .map(|server| async move { (server.name(), server.stop(options).await) })
            .collect();

        let mut first_error: Option<BoxError> = None;
        while let Some((name, result)) = stops.next().await {
            match result {
                Ok(()) => info!("Server {} stopped", name),
                Err(e) => {
                    warn!("Server {} failed to stop: {}", name, e);
                    first_error.get_or_insert(e);
                }
            }
        }

        {
            let mut shared = self.shared.lock();
            if matches!(
                shared.state,
                Some(ExitState::Stopping) | Some(ExitState::Prestopped)
            ) {
                shared.state = Some(if first_error.is_some() {
                    ExitState::Errored
                } else {
                    ExitState::Stopped
                });
            }
        }

        match first_error {
            Some(e) => Err(ExitingError::Shutdown(e)),
            None => Ok(()),
        }
    }
}

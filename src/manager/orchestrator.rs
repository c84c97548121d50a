use super::ExitState;
use crate::config::ManagerOptions;
use crate::error::{ExitingError, Result};
use crate::gate::ExitGate;
use crate::registry::ExitRegistry;
use crate::server::ServerSet;
use crate::terminator::Terminator;
use crate::triggers::TriggerRouter;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::{debug, info};
use uuid::Uuid;

/// Coordinates the lifecycle of a set of servers with process termination.
///
/// Cheap to clone; every clone drives the same manager.
///
/// With [`ManagerOptions::catch_panics`] on, any panic in the process counts as
/// an uncaught exception and aborts, even one that is later caught with
/// `catch_unwind` or surfaces as a `JoinError`. Hosts that recover from panics
/// should turn it off.
#[derive(Clone)]
pub struct Manager {
    pub(super) inner: Arc<ManagerInner>,
}

pub(crate) struct ManagerInner {
    pub(super) id: Uuid,
    pub(super) servers: ServerSet,
    pub(super) options: ManagerOptions,
    pub(super) registry: Arc<ExitRegistry>,
    pub(super) terminator: Arc<dyn Terminator>,
    pub(super) gate: ExitGate,
    pub(super) shared: Mutex<Shared>,
}

/// Mutable manager state. Never held across an await point.
#[derive(Default)]
pub(super) struct Shared {
    pub(super) state: Option<ExitState>,
    pub(super) exit_code: i32,
    pub(super) active: bool,
    pub(super) deactivated: bool,
    pub(super) exit_requested: bool,
    pub(super) terminated: bool,
    pub(super) runtime: Option<Handle>,
    pub(super) router: Option<TriggerRouter>,
}

impl Manager {
    /// Create a manager registered in the global registry
    pub fn new(servers: impl Into<ServerSet>, options: ManagerOptions) -> Result<Self> {
        Self::with_registry(ExitRegistry::global(), servers, options)
    }

    /// Create a manager registered in `registry`
    pub fn with_registry(
        registry: Arc<ExitRegistry>,
        servers: impl Into<ServerSet>,
        options: ManagerOptions,
    ) -> Result<Self> {
        let servers = servers.into();
        if servers.is_empty() {
            return Err(ExitingError::NoServers);
        }

        let manager = Self {
            inner: Arc::new(ManagerInner {
                id: Uuid::new_v4(),
                servers,
                terminator: registry.terminator(),
                registry: Arc::clone(&registry),
                options,
                gate: ExitGate::new(),
                shared: Mutex::new(Shared::default()),
            }),
        };

        registry.register(&manager)?;

        info!(
            "Created manager {} for {} server(s)",
            manager.inner.id,
            manager.inner.servers.len()
        );
        Ok(manager)
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Current state, `None` until [`Manager::start`] is called
    pub fn state(&self) -> Option<ExitState> {
        self.inner.shared.lock().state
    }

    /// Highest exit code requested so far
    pub fn exit_code(&self) -> i32 {
        self.inner.shared.lock().exit_code
    }

    pub fn is_active(&self) -> bool {
        self.inner.shared.lock().active
    }

    pub fn servers(&self) -> &ServerSet {
        &self.inner.servers
    }

    pub fn options(&self) -> &ManagerOptions {
        &self.inner.options
    }

    /// Detach from every trigger and free the registry slot.
    ///
    /// Any exit path in progress becomes inert. Idempotent.
    pub fn deactivate(&self) {
        let router = {
            let mut shared = self.inner.shared.lock();
            shared.active = false;
            shared.deactivated = true;
            shared.router.take()
        };

        self.inner.gate.disarm();
        if let Some(router) = router {
            router.uninstall();
        }
        self.inner.registry.release(self.inner.id);

        debug!("Manager {} deactivated", self.inner.id);
    }
}

impl fmt::Debug for Manager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let shared = self.inner.shared.lock();
        f.debug_struct("Manager")
            .field("id", &self.inner.id)
            .field("servers", &self.inner.servers.len())
            .field("state", &shared.state)
            .field("exit_code", &shared.exit_code)
            .field("active", &shared.active)
            .finish()
    }
}

//! The contract every managed server satisfies.
//!
//! The manager never looks inside a server. It only starts it, stops it, hooks
//! into the start of its stop sequence and watches its listener for a close it
//! did not ask for.

use crate::error::BoxError;
use async_trait::async_trait;
use futures::future::BoxFuture;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Options passed to [`Server::stop`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StopOptions {
    /// Grace period the server may use for its own shutdown
    pub timeout: Duration,
}

impl Default for StopOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
        }
    }
}

/// Lifecycle extension points a server exposes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExtPoint {
    /// Runs at the beginning of the server's stop sequence. A handler error
    /// aborts the stop, which then fails.
    PreStop,
}

/// Handler registered through [`Server::ext`]
pub type ExtHandler = Arc<dyn Fn() -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// One-shot "listener closed" notification shared between a server and its watchers
#[derive(Debug, Clone, Default)]
pub struct ListenerHandle {
    token: CancellationToken,
}

impl ListenerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fire the close notification. Later calls are no-ops.
    pub fn close(&self) {
        self.token.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Resolves once the listener has closed
    pub async fn closed(&self) {
        self.token.cancelled().await
    }
}

/// A component the manager starts and stops.
///
/// Implementations should return errors rather than panic: with panic catching
/// on, a panic aborts the process even if the server recovers from it.
#[async_trait]
pub trait Server: Send + Sync {
    /// Name used in diagnostics
    fn name(&self) -> &str;

    /// Bring the server up.
    ///
    /// A [`crate::ProcessExit`] returned here is treated as the escape marker,
    /// never as a start failure.
    async fn start(&self) -> Result<(), BoxError>;

    /// Bring the server down, running any registered pre-stop handlers first
    async fn stop(&self, options: StopOptions) -> Result<(), BoxError>;

    /// Register a lifecycle handler
    fn ext(&self, point: ExtPoint, handler: ExtHandler);

    /// The underlying listener, which may close independently of [`Server::stop`]
    fn listener(&self) -> ListenerHandle;
}

/// Ordered collection of managed servers
#[derive(Clone, Default)]
pub struct ServerSet {
    servers: Vec<Arc<dyn Server>>,
}

impl ServerSet {
    pub fn new(servers: Vec<Arc<dyn Server>>) -> Self {
        Self { servers }
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Arc<dyn Server>> {
        self.servers.iter()
    }
}

impl<S: Server + 'static> From<Arc<S>> for ServerSet {
    fn from(server: Arc<S>) -> Self {
        Self {
            servers: vec![server as Arc<dyn Server>],
        }
    }
}

impl From<Vec<Arc<dyn Server>>> for ServerSet {
    fn from(servers: Vec<Arc<dyn Server>>) -> Self {
        Self::new(servers)
    }
}

impl<'a> IntoIterator for &'a ServerSet {
    type Item = &'a Arc<dyn Server>;
    type IntoIter = std::slice::Iter<'a, Arc<dyn Server>>;

    fn into_iter(self) -> Self::IntoIter {
        self.servers.iter()
    }
}

use crate::escape::ProcessExit;
use thiserror::Error;

/// Error type the collaborator contract speaks: anything a server can fail with
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Error, Debug)]
pub enum ExitingError {
    #[error("Only one active manager is allowed per registry")]
    AlreadyActive,

    #[error("A manager needs at least one server")]
    NoServers,

    #[error("Cannot {operation} while in state {state}")]
    InvalidState { operation: String, state: String },

    #[error("Server failed to start: {0}")]
    Startup(#[source] BoxError),

    #[error("Server failed to stop: {0}")]
    Shutdown(#[source] BoxError),

    #[error("Process aborted")]
    ProcessAborted,

    #[error("Failed to install signal handler: {0}")]
    SignalInstall(#[source] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Exit(#[from] ProcessExit),
}

impl ExitingError {
    pub fn invalid_state<S: Into<String>, T: std::fmt::Display>(operation: S, state: T) -> Self {
        Self::InvalidState {
            operation: operation.into(),
            state: state.to_string(),
        }
    }

    /// True for the escape marker, which must be let through rather than handled
    pub fn is_escape(&self) -> bool {
        matches!(self, Self::Exit(_))
    }
}

pub type Result<T> = std::result::Result<T, ExitingError>;

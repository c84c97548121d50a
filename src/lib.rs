pub mod config;
pub mod error;
pub mod escape;
pub mod manager;
pub mod registry;
pub mod server;
pub mod terminator;
pub mod triggers;

mod gate;

pub use config::{default_log_sink, ExitingConfig, LogSink, ManagerOptions};
pub use error::{BoxError, ExitingError, Result};
pub use escape::{is_escape, ProcessExit};
pub use manager::{ExitState, Manager, ABORT_EXIT_CODE, SEVERE_EXIT_CODE};
pub use registry::{exit, reset, ExitRegistry, SignalListenerGuard};
pub use server::{ExtHandler, ExtPoint, ListenerHandle, Server, ServerSet, StopOptions};
pub use terminator::{CapturingTerminator, ProcessTerminator, Terminator};
pub use triggers::{Signal, UnhandledKind};

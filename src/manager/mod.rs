//! The shutdown manager.
//!
//! ```text
//!   unset ──start──> starting ──ok──> started ──exit──> stopping ──pre-stop──> prestopped
//!                       │                                   │                      │
//!                     exit                                stop                   stop
//!                       v                                   v                      v
//!                  startAborted ──start done──> ... ──> stopped | errored ──> terminate
//!
//!   any non-terminal ──exit gate expires──> timeout ──> terminate(255)
//! ```
//!
//! Every trigger funnels into the manager's internal exit request, which raises
//! the exit code, arms the exit gate and advances the state machine.

mod exit;
mod orchestrator;
mod shutdown;
mod startup;
mod types;

#[cfg(test)]
mod tests;

pub use exit::{ABORT_EXIT_CODE, SEVERE_EXIT_CODE};
pub use orchestrator::Manager;
pub(crate) use orchestrator::ManagerInner;
pub use types::ExitState;

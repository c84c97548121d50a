use std::fmt;

/// Lifecycle state of a manager. A fresh manager has no state at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitState {
    Starting,
    Started,
    Stopping,
    Prestopped,
    Stopped,
    StartAborted,
    Errored,
    Timeout,
}

impl ExitState {
    /// Stopped, errored or timed out: nothing further will happen to the servers
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExitState::Stopped | ExitState::Errored | ExitState::Timeout
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExitState::Starting => "starting",
            ExitState::Started => "started",
            ExitState::Stopping => "stopping",
            ExitState::Prestopped => "prestopped",
            ExitState::Stopped => "stopped",
            ExitState::StartAborted => "startAborted",
            ExitState::Errored => "errored",
            ExitState::Timeout => "timeout",
        }
    }
}

impl fmt::Display for ExitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub(crate) fn describe(state: Option<ExitState>) -> &'static str {
    state.map_or("unset", |state| state.as_str())
}

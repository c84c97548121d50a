use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Prefix the default log sink puts in front of every message
pub const LOG_PREFIX: &str = "[exiting]";

/// Diagnostic sink for messages that must reach an operator even without a subscriber
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// Writes `[exiting] <message>` to stderr
pub fn default_log_sink() -> LogSink {
    Arc::new(|message: &str| {
        let _ = writeln!(std::io::stderr().lock(), "{} {}", LOG_PREFIX, message);
    })
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
pub struct ExitingConfig {
    /// Milliseconds before a shutdown in progress is forcibly terminated
    #[serde(default = "default_exit_timeout_ms")]
    pub exit_timeout_ms: u64,

    /// Milliseconds of the exit timeout withheld from the servers' own stop grace period
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,

    /// Listen for SIGINT, SIGTERM and SIGQUIT
    #[serde(default = "default_os_signals")]
    pub os_signals: bool,

    /// Treat panics as uncaught exceptions, including ones a caller later
    /// recovers with `catch_unwind` or observes as a `JoinError`
    #[serde(default = "default_catch_panics")]
    pub catch_panics: bool,
}

impl ExitingConfig {
    /// Load configuration from a specific file path, overridden by `EXITING_*` variables
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path_str = path.as_ref().to_string_lossy();
        debug!("Loading configuration from: {}", path_str);

        let settings = Config::builder()
            .set_default("exit_timeout_ms", default_exit_timeout_ms())?
            .set_default("stop_grace_ms", default_stop_grace_ms())?
            .set_default("os_signals", default_os_signals())?
            .set_default("catch_panics", default_catch_panics())?
            .add_source(File::with_name(&path_str).required(false))
            .add_source(Environment::with_prefix("EXITING"))
            .build()?;

        let config: ExitingConfig = settings.try_deserialize()?;

        info!("Configuration loaded successfully");
        debug!("Final configuration: {:#?}", config);

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.exit_timeout_ms == 0 {
            return Err(ConfigError::Message(
                "exit_timeout_ms must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }
}

impl Default for ExitingConfig {
    fn default() -> Self {
        Self {
            exit_timeout_ms: default_exit_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
            os_signals: default_os_signals(),
            catch_panics: default_catch_panics(),
        }
    }
}

fn default_exit_timeout_ms() -> u64 {
    5000
}
fn default_stop_grace_ms() -> u64 {
    500
}
fn default_os_signals() -> bool {
    true
}
fn default_catch_panics() -> bool {
    true
}

/// Runtime options for a [`crate::Manager`]
#[derive(Clone)]
pub struct ManagerOptions {
    pub exit_timeout: Duration,
    pub stop_grace: Duration,
    pub os_signals: bool,
    pub catch_panics: bool,
    pub log: LogSink,
}

impl ManagerOptions {
    pub fn with_exit_timeout(mut self, exit_timeout: Duration) -> Self {
        self.exit_timeout = exit_timeout;
        self
    }

    pub fn with_stop_grace(mut self, stop_grace: Duration) -> Self {
        self.stop_grace = stop_grace;
        self
    }

    pub fn with_os_signals(mut self, enabled: bool) -> Self {
        self.os_signals = enabled;
        self
    }

    /// Route every panic to the exit path with code 1.
    ///
    /// The hook runs before unwinding, so a panic the host catches later with
    /// `catch_unwind`, or sees as a `JoinError` from a task handle, still aborts.
    pub fn with_catch_panics(mut self, enabled: bool) -> Self {
        self.catch_panics = enabled;
        self
    }

    pub fn with_log(mut self, log: LogSink) -> Self {
        self.log = log;
        self
    }

    /// Grace period handed to servers when the exit path stops them
    pub fn stop_timeout(&self) -> Duration {
        self.exit_timeout.saturating_sub(self.stop_grace)
    }
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self::from(&ExitingConfig::default())
    }
}

impl From<&ExitingConfig> for ManagerOptions {
    fn from(config: &ExitingConfig) -> Self {
        Self {
            exit_timeout: Duration::from_millis(config.exit_timeout_ms),
            stop_grace: Duration::from_millis(config.stop_grace_ms),
            os_signals: config.os_signals,
            catch_panics: config.catch_panics,
            log: default_log_sink(),
        }
    }
}

impl fmt::Debug for ManagerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManagerOptions")
            .field("exit_timeout", &self.exit_timeout)
            .field("stop_grace", &self.stop_grace)
            .field("os_signals", &self.os_signals)
            .field("catch_panics", &self.catch_panics)
            .finish_non_exhaustive()
    }
}

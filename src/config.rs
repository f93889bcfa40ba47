//! Pool sizing and worker-launch configuration.
//!
//! A [`PoolConfig`] bundles the sizing knobs of the pool (bounds, idle
//! pruning, recycling, call timeouts) with the [`LaunchSpec`] describing how
//! worker processes are started. Configurations can be built in code or
//! loaded from a TOML file:
//!
//! ```toml
//! min = 2
//! max = 8
//! max_idle_secs = 20
//! recycle_after = 500
//! timeout_signal = "kill"
//!
//! [worker]
//! command = "/usr/local/bin/corral-worker"
//! args = ["--log-dir", "/var/log/corral"]
//! library_paths = ["/opt/corral/lib"]
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{CorralError, Result};

/// Termination signal delivered to a worker's process group.
///
/// On platforms without signals the distinction collapses to a forced kill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    /// Polite termination (SIGTERM on Unix).
    Term,
    /// Forced kill (SIGKILL on Unix, `taskkill /F` on Windows).
    Kill,
}

/// How worker processes are constructed.
///
/// The pool launches a statically configured executable; there is no
/// interpreter bootstrap. `run_as_user`/`run_as_group` are applied via
/// `setuid`/`setgid` on Unix and ignored elsewhere.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Path to the worker executable.
    pub command: PathBuf,
    /// Extra arguments passed to the worker.
    pub args: Vec<String>,
    /// Environment variables set for the worker (on top of the inherited
    /// environment).
    pub env: BTreeMap<String, String>,
    /// Working directory for the worker; inherited when `None`.
    pub working_dir: Option<PathBuf>,
    /// Directories merged into the worker's library search path.
    ///
    /// Deduplicated and prepended to any pre-existing value of the search
    /// path variable; existing entries are appended, never overwritten.
    pub library_paths: Vec<PathBuf>,
    /// Name of the search path variable; platform default when `None`
    /// (`LD_LIBRARY_PATH` on Unix, `PATH` on Windows).
    pub library_path_var: Option<String>,
    /// Numeric user id to run the worker as (Unix only).
    pub run_as_user: Option<u32>,
    /// Numeric group id to run the worker as (Unix only).
    pub run_as_group: Option<u32>,
}

#[cfg(unix)]
const DEFAULT_LIBRARY_PATH_VAR: &str = "LD_LIBRARY_PATH";
#[cfg(not(unix))]
const DEFAULT_LIBRARY_PATH_VAR: &str = "PATH";

impl LaunchSpec {
    /// Create a spec that launches `command` with no extra arguments.
    pub fn new(command: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            library_paths: Vec::new(),
            library_path_var: None,
            run_as_user: None,
            run_as_group: None,
        }
    }

    /// The effective search path variable name.
    pub fn path_var(&self) -> &str {
        self.library_path_var
            .as_deref()
            .unwrap_or(DEFAULT_LIBRARY_PATH_VAR)
    }
}

/// Pool sizing and scheduling configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Lower bound on the number of worker processes.
    pub min: usize,
    /// Upper bound on the number of worker processes.
    pub max: usize,
    /// Idle time after which a surplus ready worker is pruned. Also the
    /// period of the pruning loop.
    pub max_idle: Duration,
    /// Number of calls after which a worker is gracefully retired and
    /// replaced. `0` disables recycling.
    pub recycle_after: u32,
    /// Default per-call timeout; `None` means calls never time out unless
    /// the caller asks for a deadline.
    pub call_timeout: Option<Duration>,
    /// Signal sent to a worker's process group when a call times out.
    pub timeout_signal: Signal,
    /// How long a graceful retirement may take before the worker is
    /// force-killed.
    pub stop_grace: Duration,
    /// How worker processes are launched.
    pub launch: LaunchSpec,
}

impl PoolConfig {
    /// Create a configuration with default sizing for the given worker
    /// executable.
    pub fn new(worker_command: impl Into<PathBuf>) -> Self {
        Self {
            min: 5,
            max: 20,
            max_idle: Duration::from_secs(20),
            recycle_after: 500,
            call_timeout: None,
            timeout_signal: Signal::Kill,
            stop_grace: Duration::from_secs(5),
            launch: LaunchSpec::new(worker_command),
        }
    }

    /// Check the sizing bounds.
    ///
    /// # Errors
    ///
    /// Returns `InvalidArgument` if `max` is zero or `min > max`.
    pub fn validate(&self) -> Result<()> {
        validate_bounds(self.min, self.max)
    }

    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let raw: RawConfig = toml::from_str(text)?;
        let config = raw.into_config();
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file.
    pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}

/// Shared bounds check used by [`PoolConfig::validate`] and pool resizing.
pub(crate) fn validate_bounds(min: usize, max: usize) -> Result<()> {
    if max == 0 {
        return Err(CorralError::InvalidArgument(
            "pool size: max must be at least 1".to_string(),
        ));
    }
    if min > max {
        return Err(CorralError::InvalidArgument(format!(
            "pool size: min ({min}) must not exceed max ({max})"
        )));
    }
    Ok(())
}

/// On-disk TOML shape; durations are spelled out in seconds/milliseconds.
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    worker: RawLaunch,
    #[serde(default = "default_min")]
    min: usize,
    #[serde(default = "default_max")]
    max: usize,
    #[serde(default = "default_max_idle_secs")]
    max_idle_secs: u64,
    #[serde(default = "default_recycle_after")]
    recycle_after: u32,
    #[serde(default)]
    call_timeout_ms: Option<u64>,
    #[serde(default = "default_timeout_signal")]
    timeout_signal: Signal,
    #[serde(default = "default_stop_grace_secs")]
    stop_grace_secs: u64,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct RawLaunch {
    command: PathBuf,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    working_dir: Option<PathBuf>,
    #[serde(default)]
    library_paths: Vec<PathBuf>,
    #[serde(default)]
    library_path_var: Option<String>,
    #[serde(default)]
    run_as_user: Option<u32>,
    #[serde(default)]
    run_as_group: Option<u32>,
}

fn default_min() -> usize {
    5
}

fn default_max() -> usize {
    20
}

fn default_max_idle_secs() -> u64 {
    20
}

fn default_recycle_after() -> u32 {
    500
}

fn default_timeout_signal() -> Signal {
    Signal::Kill
}

fn default_stop_grace_secs() -> u64 {
    5
}

impl RawConfig {
    fn into_config(self) -> PoolConfig {
        PoolConfig {
            min: self.min,
            max: self.max,
            max_idle: Duration::from_secs(self.max_idle_secs),
            recycle_after: self.recycle_after,
            call_timeout: self.call_timeout_ms.map(Duration::from_millis),
            timeout_signal: self.timeout_signal,
            stop_grace: Duration::from_secs(self.stop_grace_secs),
            launch: LaunchSpec {
                command: self.worker.command,
                args: self.worker.args,
                env: self.worker.env,
                working_dir: self.worker.working_dir,
                library_paths: self.worker.library_paths,
                library_path_var: self.worker.library_path_var,
                run_as_user: self.worker.run_as_user,
                run_as_group: self.worker.run_as_group,
            },
        }
    }
}

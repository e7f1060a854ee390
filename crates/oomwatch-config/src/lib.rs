use std::path::{Path, PathBuf};
use std::time::Duration;

use oomwatch_host::{AbortAction, PsiScope, PsiTrigger, StallKind};
use oomwatch_memory::{WatchdogSettings, DEFAULT_MARKER_PATH, DEFAULT_TICK_INTERVAL};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod diagnostics;
mod logging;
mod validation;

pub use diagnostics::{ConfigDiagnostics, ConfigValidationError, ConfigWarning, ValidationDiagnostics};
pub use logging::{init_tracing, LoggingConfig};

/// Environment variable overriding the config file location.
pub const OOMWATCH_CONFIG_ENV_VAR: &str = "OOMWATCH_CONFIG";

/// Config file used when neither the command line nor the environment names one.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/oomwatch.toml";

/// Top-level `oomwatch.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OomwatchConfig {
    #[serde(default)]
    pub watchdog: WatchdogConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub abort: AbortConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Live tunables of the watchdog. The kernel-era sysctl names are accepted as
/// aliases so existing settings carry over unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchdogConfig {
    /// Seconds of continuous distress before a forced abort. `0` disables it.
    #[serde(default, alias = "gracetime")]
    pub grace_time_secs: u64,

    /// Seconds without distress after which an episode is over.
    #[serde(default = "WatchdogConfig::default_reset_time_secs", alias = "resettime")]
    pub reset_time_secs: u64,

    /// Emergency reserve size in MiB. `0` disables the reserve.
    #[serde(default = "WatchdogConfig::default_reserve_size_mb", alias = "bufsize")]
    pub reserve_size_mb: u64,

    /// Write the distress marker and wait for it before aborting.
    #[serde(default = "WatchdogConfig::default_crash_flag", alias = "crashflag")]
    pub crash_flag: bool,

    #[serde(default = "WatchdogConfig::default_marker_path", alias = "crashflag_name")]
    pub marker_path: PathBuf,

    /// Period of the state machine worker.
    #[serde(default = "WatchdogConfig::default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// `mlock` the reserve so it cannot be swapped out.
    #[serde(default)]
    pub lock_reserve: bool,
}

impl WatchdogConfig {
    fn default_reset_time_secs() -> u64 {
        300
    }

    fn default_reserve_size_mb() -> u64 {
        32
    }

    fn default_crash_flag() -> bool {
        true
    }

    fn default_marker_path() -> PathBuf {
        PathBuf::from(DEFAULT_MARKER_PATH)
    }

    fn default_tick_interval_ms() -> u64 {
        DEFAULT_TICK_INTERVAL.as_millis() as u64
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            grace_time_secs: 0,
            reset_time_secs: Self::default_reset_time_secs(),
            reserve_size_mb: Self::default_reserve_size_mb(),
            crash_flag: Self::default_crash_flag(),
            marker_path: Self::default_marker_path(),
            tick_interval_ms: Self::default_tick_interval_ms(),
            lock_reserve: false,
        }
    }
}

/// PSI trigger feeding distress notifications.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Disable to run the watchdog without a notification source (testing).
    #[serde(default = "SourceConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub scope: PsiScope,
    #[serde(default)]
    pub kind: StallKind,
    /// Stall time within `window_ms` that fires the trigger.
    #[serde(default = "SourceConfig::default_threshold_ms")]
    pub threshold_ms: u64,
    #[serde(default = "SourceConfig::default_window_ms")]
    pub window_ms: u64,
    /// Upper bound on how long the poll thread takes to notice shutdown.
    #[serde(default = "SourceConfig::default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

impl SourceConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_threshold_ms() -> u64 {
        150
    }

    fn default_window_ms() -> u64 {
        1_000
    }

    fn default_poll_timeout_ms() -> u64 {
        250
    }

    pub fn trigger(&self) -> PsiTrigger {
        PsiTrigger {
            kind: self.kind,
            threshold: Duration::from_millis(self.threshold_ms),
            window: Duration::from_millis(self.window_ms),
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            scope: PsiScope::default(),
            kind: StallKind::default(),
            threshold_ms: Self::default_threshold_ms(),
            window_ms: Self::default_window_ms(),
            poll_timeout_ms: Self::default_poll_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AbortConfig {
    #[serde(default)]
    pub action: AbortAction,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse toml config: {0}")]
    Toml(String),
}

impl From<toml::de::Error> for ConfigError {
    fn from(err: toml::de::Error) -> Self {
        // The default `Display` embeds a source snippet; keep only the message.
        ConfigError::Toml(err.message().to_owned())
    }
}

impl OomwatchConfig {
    /// Load a config file from TOML.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = read_config(path.as_ref())?;
        Ok(toml::from_str(&text)?)
    }

    /// Load a config file and report unknown keys and validation failures.
    pub fn load_from_path_with_diagnostics(
        path: impl AsRef<Path>,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let text = read_config(path.as_ref())?;
        Self::load_from_str_with_diagnostics(&text)
    }

    pub fn load_from_str_with_diagnostics(
        text: &str,
    ) -> Result<(Self, ConfigDiagnostics), ConfigError> {
        let (config, unknown_keys) =
            diagnostics::deserialize_toml_with_unknown_keys::<OomwatchConfig>(text)?;

        let mut diagnostics = ConfigDiagnostics {
            unknown_keys,
            ..ConfigDiagnostics::default()
        };
        diagnostics.extend_validation(config.validate());

        Ok((config, diagnostics))
    }

    /// The core's view of the `[watchdog]` section.
    pub fn watchdog_settings(&self) -> WatchdogSettings {
        let watchdog = &self.watchdog;
        WatchdogSettings {
            grace_time: Duration::from_secs(watchdog.grace_time_secs),
            reset_time: Duration::from_secs(watchdog.reset_time_secs),
            reserve_size_mb: watchdog.reserve_size_mb,
            crash_flag: watchdog.crash_flag,
            marker_path: watchdog.marker_path.clone(),
            lock_reserve: watchdog.lock_reserve,
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog.tick_interval_ms)
    }
}

fn read_config(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })
}

/// Resolve the config file location.
///
/// Search order:
/// 1) `explicit` (the `--config` flag)
/// 2) `OOMWATCH_CONFIG`
/// 3) [`DEFAULT_CONFIG_PATH`], if it exists
pub fn discover_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return Some(path.to_path_buf());
    }
    if let Some(value) = std::env::var_os(OOMWATCH_CONFIG_ENV_VAR) {
        return Some(PathBuf::from(value));
    }
    let default = PathBuf::from(DEFAULT_CONFIG_PATH);
    default.is_file().then_some(default)
}

/// Load the effective configuration.
///
/// Without a config file, returns [`OomwatchConfig::default`] and `None`.
pub fn load(explicit: Option<&Path>) -> Result<(OomwatchConfig, Option<PathBuf>), ConfigError> {
    let Some(path) = discover_config_path(explicit) else {
        return Ok((OomwatchConfig::default(), None));
    };
    let config = OomwatchConfig::load_from_path(&path)?;
    Ok((config, Some(path)))
}

/// Re-read `path` and report whether anything changed.
pub fn reload(
    path: &Path,
    previous: &OomwatchConfig,
) -> Result<(OomwatchConfig, ConfigDiagnostics, bool), ConfigError> {
    let (config, diagnostics) = OomwatchConfig::load_from_path_with_diagnostics(path)?;
    let changed = &config != previous;
    Ok((config, diagnostics, changed))
}

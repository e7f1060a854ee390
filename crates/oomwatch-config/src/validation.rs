use crate::diagnostics::{ConfigValidationError, ConfigWarning, ValidationDiagnostics};
use crate::{LoggingConfig, OomwatchConfig};

use oomwatch_host::AbortAction;

impl OomwatchConfig {
    /// Validate semantic invariants.
    ///
    /// Reports as many problems as possible in one pass.
    #[must_use]
    pub fn validate(&self) -> ValidationDiagnostics {
        let mut out = ValidationDiagnostics::default();

        validate_watchdog(self, &mut out);
        validate_source(self, &mut out);
        validate_logging(self, &mut out);

        out
    }
}

fn error(out: &mut ValidationDiagnostics, toml_path: &str, message: impl Into<String>) {
    out.errors.push(ConfigValidationError::InvalidValue {
        toml_path: toml_path.to_owned(),
        message: message.into(),
    });
}

fn warning(out: &mut ValidationDiagnostics, toml_path: &str, message: impl Into<String>) {
    out.warnings.push(ConfigWarning::InvalidValue {
        toml_path: toml_path.to_owned(),
        message: message.into(),
    });
}

fn validate_watchdog(config: &OomwatchConfig, out: &mut ValidationDiagnostics) {
    let watchdog = &config.watchdog;

    if watchdog.tick_interval_ms == 0 {
        error(out, "watchdog.tick_interval_ms", "must be >= 1");
    }

    if watchdog.crash_flag {
        if watchdog.marker_path.as_os_str().is_empty() {
            error(out, "watchdog.marker_path", "must not be empty while crash_flag is set");
        } else if !watchdog.marker_path.is_absolute() {
            error(out, "watchdog.marker_path", "must be an absolute path");
        }
    }

    // The handler only sees grace expiry on notifications and the marker
    // only appears on ticks; a grace shorter than a tick is effectively one tick.
    if watchdog.grace_time_secs > 0
        && watchdog.grace_time_secs.saturating_mul(1_000) < watchdog.tick_interval_ms
    {
        warning(
            out,
            "watchdog.grace_time_secs",
            "shorter than tick_interval_ms; the abort waits for the next tick",
        );
    }

    if watchdog.grace_time_secs > 0
        && !watchdog.crash_flag
        && matches!(config.abort.action, AbortAction::Panic | AbortAction::Reboot)
    {
        warning(
            out,
            "watchdog.crash_flag",
            "disabled; a forced reboot will leave no distress marker behind",
        );
    }
}

fn validate_source(config: &OomwatchConfig, out: &mut ValidationDiagnostics) {
    let source = &config.source;
    if !source.enabled {
        warning(out, "source.enabled", "disabled; nothing will report distress");
        return;
    }

    if let Err(err) = source.trigger().validate() {
        error(out, "source", err.to_string());
    }
    if source.poll_timeout_ms == 0 {
        error(out, "source.poll_timeout_ms", "must be >= 1");
    }
}

fn validate_logging(config: &OomwatchConfig, out: &mut ValidationDiagnostics) {
    let normalized = LoggingConfig::normalize_level_directives(&config.logging.level);
    if !config.logging.level.trim().is_empty()
        && tracing_subscriber::EnvFilter::try_new(normalized.clone()).is_err()
    {
        out.warnings.push(ConfigWarning::LoggingLevelInvalid {
            value: config.logging.level.clone(),
            normalized,
        });
    }
}

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use oomwatch_config::OomwatchConfig;
use oomwatch_host::{cgroup, host_abort, AbortAction, PsiMonitor, PsiSource};
use oomwatch_memory::{CancellationToken, DistressMonitor, Tunables, Watchdog};
use tokio::signal::unix::{signal, SignalKind};

use crate::RunArgs;

pub(crate) fn run(explicit: Option<&Path>, args: RunArgs) -> Result<i32> {
    let (config, path, diagnostics) = crate::load_checked(explicit)?;
    oomwatch_config::init_tracing(&config.logging);

    for key in &diagnostics.unknown_keys {
        tracing::warn!(target = "oomwatch.cli", key = %key, "unknown config key ignored");
    }
    for warning in &diagnostics.warnings {
        tracing::warn!(target = "oomwatch.cli", "{warning}");
    }
    if !diagnostics.is_ok() {
        let errors: Vec<String> = diagnostics.errors.iter().map(ToString::to_string).collect();
        bail!("invalid configuration:\n  {}", errors.join("\n  "));
    }

    let action = if args.dry_run {
        AbortAction::DryRun
    } else {
        config.abort.action
    };
    let abort = host_abort(action).context("failed to prepare the abort action")?;
    let tunables = Arc::new(Tunables::new(&config.watchdog_settings()));
    let monitor = DistressMonitor::builder(tunables.clone(), abort)
        .memory_limit(cgroup::own_memory_limit_bytes())
        .build();

    // Arm before allocating the reserve so a bad trigger fails fast.
    let source = if config.source.enabled {
        let pressure_path = config.source.scope.pressure_path()?;
        Some(
            PsiSource::arm(&pressure_path, config.source.trigger())?
                .with_poll_timeout(config.source.poll_timeout()),
        )
    } else {
        tracing::warn!(
            target = "oomwatch.cli",
            "notification source disabled; distress will never be reported"
        );
        None
    };

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;

    runtime.block_on(async move {
        let watchdog = Watchdog::start(monitor, config.tick_interval());
        let token = CancellationToken::new();
        let psi = source
            .map(|source| source.spawn(watchdog.notifier(), token.child_token()))
            .transpose()?;

        let outcome = serve(&tunables, config, path).await;

        watchdog
            .shutdown_with(async {
                token.cancel();
                if let Some(psi) = psi {
                    stop_source(psi).await;
                }
            })
            .await;
        outcome.map(|()| 0)
    })
}

/// Waits for a termination signal, reloading the config on `SIGHUP`.
async fn serve(tunables: &Tunables, mut current: OomwatchConfig, path: Option<PathBuf>) -> Result<()> {
    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("failed to install SIGINT handler")?;

    loop {
        tokio::select! {
            _ = terminate.recv() => break,
            _ = interrupt.recv() => break,
            _ = hangup.recv() => {
                if let Some(path) = &path {
                    current = reload(tunables, path, current);
                } else {
                    tracing::info!(target = "oomwatch.cli", "SIGHUP ignored; no config file");
                }
            }
        }
    }

    tracing::info!(target = "oomwatch.cli", "shutting down");
    Ok(())
}

fn reload(tunables: &Tunables, path: &Path, current: OomwatchConfig) -> OomwatchConfig {
    let (config, diagnostics, changed) = match oomwatch_config::reload(path, &current) {
        Ok(reloaded) => reloaded,
        Err(err) => {
            tracing::error!(target = "oomwatch.cli", error = %err, "config reload failed; keeping previous settings");
            return current;
        }
    };
    if !diagnostics.is_ok() {
        for error in &diagnostics.errors {
            tracing::error!(target = "oomwatch.cli", "{error}");
        }
        tracing::error!(target = "oomwatch.cli", "reloaded config is invalid; keeping previous settings");
        return current;
    }
    if !changed {
        tracing::info!(target = "oomwatch.cli", "config unchanged");
        return current;
    }

    tunables.apply(&config.watchdog_settings());
    tracing::info!(
        target = "oomwatch.cli",
        grace_time_secs = config.watchdog.grace_time_secs,
        reset_time_secs = config.watchdog.reset_time_secs,
        reserve_size_mb = config.watchdog.reserve_size_mb,
        crash_flag = config.watchdog.crash_flag,
        "watchdog tunables reloaded"
    );
    if config.watchdog.tick_interval_ms != current.watchdog.tick_interval_ms
        || config.source != current.source
        || config.abort != current.abort
        || config.logging != current.logging
    {
        tracing::warn!(
            target = "oomwatch.cli",
            "tick interval, source, abort and logging changes apply after a restart"
        );
    }
    config
}

async fn stop_source(psi: PsiMonitor) {
    match tokio::task::spawn_blocking(move || psi.stop()).await {
        Ok(events) => tracing::info!(target = "oomwatch.cli", events, "notification source stopped"),
        Err(err) => tracing::error!(target = "oomwatch.cli", error = %err, "notification source did not stop cleanly"),
    }
}

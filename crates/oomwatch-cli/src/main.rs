use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use oomwatch_config::{ConfigDiagnostics, OomwatchConfig};
use serde::Serialize;
use std::path::{Path, PathBuf};

mod daemon;
mod status;

#[derive(Parser)]
#[command(
    name = "oomwatch",
    version,
    about = "Out-of-memory distress watchdog (emergency reserve, distress marker, forced abort)"
)]
struct Cli {
    /// Config file (defaults to $OOMWATCH_CONFIG, then /etc/oomwatch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the watchdog until SIGTERM or SIGINT; SIGHUP reloads the config
    Run(RunArgs),
    /// Show marker presence, memory pressure and memory totals (exit 1 if the marker exists)
    Status(StatusArgs),
    /// Manage the persistent distress marker
    Marker(MarkerArgs),
    /// Inspect the configuration
    Config(ConfigArgs),
}

#[derive(Args)]
pub(crate) struct RunArgs {
    /// Log instead of aborting the host when the grace time runs out
    #[arg(long)]
    pub dry_run: bool,
}

#[derive(Args)]
struct StatusArgs {
    /// Emit JSON suitable for scripts
    #[arg(long)]
    json: bool,
}

#[derive(Args)]
struct MarkerArgs {
    #[command(subcommand)]
    command: MarkerCommand,
}

#[derive(Subcommand)]
enum MarkerCommand {
    /// Delete the marker once recovery has handled it
    Clear,
}

#[derive(Args)]
struct ConfigArgs {
    #[command(subcommand)]
    command: ConfigCommand,
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Validate the config file (exit 1 on errors)
    Check {
        /// Emit the effective config and diagnostics as JSON
        #[arg(long)]
        json: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    let exit_code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{:#}", err);
            2
        }
    };

    std::process::exit(exit_code);
}

fn run(cli: Cli) -> Result<i32> {
    let config_path = cli.config.as_deref();
    match cli.command {
        Command::Run(args) => daemon::run(config_path, args),
        Command::Status(args) => {
            let (config, path) = oomwatch_config::load(config_path)?;
            let report = status::collect(&config, path);
            let exit = if report.marker_present { 1 } else { 0 };
            if args.json {
                print_json(&report)?;
            } else {
                status::print_human(&report);
            }
            Ok(exit)
        }
        Command::Marker(args) => match args.command {
            MarkerCommand::Clear => {
                let (config, _path) = oomwatch_config::load(config_path)?;
                clear_marker(&config.watchdog.marker_path)
            }
        },
        Command::Config(args) => match args.command {
            ConfigCommand::Check { json } => check_config(config_path, json),
        },
    }
}

fn clear_marker(path: &Path) -> Result<i32> {
    match std::fs::remove_file(path) {
        Ok(()) => {
            println!("marker: removed {}", path.display());
            Ok(0)
        }
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            println!("marker: none at {}", path.display());
            Ok(0)
        }
        Err(err) => Err(err).with_context(|| format!("failed to remove {}", path.display())),
    }
}

/// Loads the config with diagnostics. Without a config file the defaults are
/// validated instead.
pub(crate) fn load_checked(
    explicit: Option<&Path>,
) -> Result<(OomwatchConfig, Option<PathBuf>, ConfigDiagnostics)> {
    match oomwatch_config::discover_config_path(explicit) {
        Some(path) => {
            let (config, diagnostics) = OomwatchConfig::load_from_path_with_diagnostics(&path)?;
            Ok((config, Some(path), diagnostics))
        }
        None => {
            let config = OomwatchConfig::default();
            let validation = config.validate();
            let diagnostics = ConfigDiagnostics {
                warnings: validation.warnings,
                errors: validation.errors,
                ..ConfigDiagnostics::default()
            };
            Ok((config, None, diagnostics))
        }
    }
}

#[derive(Serialize)]
struct ConfigCheckReport<'a> {
    path: Option<&'a Path>,
    config: &'a OomwatchConfig,
    unknown_keys: &'a [String],
    warnings: Vec<String>,
    errors: Vec<String>,
}

fn check_config(explicit: Option<&Path>, json: bool) -> Result<i32> {
    let (config, path, diagnostics) = load_checked(explicit)?;
    let exit = if diagnostics.is_ok() { 0 } else { 1 };

    if json {
        print_json(&ConfigCheckReport {
            path: path.as_deref(),
            config: &config,
            unknown_keys: &diagnostics.unknown_keys,
            warnings: diagnostics.warnings.iter().map(ToString::to_string).collect(),
            errors: diagnostics.errors.iter().map(ToString::to_string).collect(),
        })?;
        return Ok(exit);
    }

    match &path {
        Some(path) => println!("config: {}", path.display()),
        None => println!("config: (none, using defaults)"),
    }
    for key in &diagnostics.unknown_keys {
        println!("unknown key: {key}");
    }
    for warning in &diagnostics.warnings {
        println!("warning: {warning}");
    }
    for error in &diagnostics.errors {
        println!("error: {error}");
    }
    println!(
        "summary: {} errors, {} warnings, {} unknown keys",
        diagnostics.errors.len(),
        diagnostics.warnings.len(),
        diagnostics.unknown_keys.len()
    );
    Ok(exit)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let out = serde_json::to_string_pretty(value)?;
    println!("{out}");
    Ok(())
}

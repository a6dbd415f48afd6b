/*============================================================
  Synavera Project: Syn-Till
  Module: syntill_core::main
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Entry point for Syn-Till Core, the self-update orchestrator
    of a Syn-Till point-of-sale installation. Gates every boot
    on pending or available updates, supervises restarts, and
    exposes operator commands for checks, applies, and recovery.

  Security / Safety Notes:
    Operates within user privileges. Performs HTTPS GETs,
    rewrites files under the configured install root only, and
    spawns the configured service command or update executor.

  Dependencies:
    clap for CLI parsing, chrono for session stamps, tokio for
    the async runtime and child processes.

  Operational Scope:
    `supervise` is the long-lived launcher; `boot` is what it
    runs. The remaining subcommands are operator tools.

  Revision History:
    2025-10-28 COD  Authored core runtime.
    2025-11-12 COD  Re-scoped to the Syn-Till update lifecycle.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Result-first error handling with deterministic exits
    - Structured logging following Synavera cadence
    - Configurable execution via CLI and config file
============================================================*/

mod config;
mod error;
mod fetch;
mod gate;
mod handoff;
mod logger;
mod marker;
mod planner;
mod prompt;
mod settings;
#[cfg(test)]
mod testkit;
mod version;

use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use chrono::Utc;
use clap::{ArgAction, Parser, Subcommand, ValueEnum};

use config::SynTillConfig;
use error::{Result, SynTillError, RESTART_EXIT_STATUS};
use fetch::{ArtifactFetcher, StagedArtifact};
use gate::{GateOutcome, StartupGate};
use handoff::{ExecutorPlan, HandoffState, ProcessHandoff};
use logger::Logger;
use marker::PendingUpdateMarker;
use planner::{ProtectedFileSet, UpdatePlanner};
use prompt::{Confirm, Decision, FixedDecision, TerminalPrompt};
use settings::JsonSettingsStore;
use version::{UpdateDescriptor, VersionOracle};

/// Seconds the detached executor waits for this process to exit.
const EXECUTOR_SETTLE_SECS: u64 = 2;

/// Command-line arguments for Syn-Till-Core.
#[derive(Debug, Parser)]
#[command(
    name = "Syn-Till-Core",
    version,
    author = "Synavera Systems",
    about = "Self-update orchestrator for Syn-Till installations"
)]
struct Cli {
    /// Override configuration file path.
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Explicit log file path.
    #[arg(long, value_name = "PATH", global = true)]
    log: Option<PathBuf>,
    /// Enable verbose logging to stderr.
    #[arg(long, action = ArgAction::SetTrue, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the startup gate, then the configured service entry point.
    Boot {
        /// Accept an available update without prompting.
        #[arg(long, action = ArgAction::SetTrue)]
        yes: bool,
        /// Decline available updates without prompting.
        #[arg(long, action = ArgAction::SetTrue, conflicts_with = "yes")]
        no_prompt: bool,
    },
    /// Re-run `boot` whenever it exits with the restart status.
    Supervise,
    /// Report whether a newer version is published.
    Check {
        /// Query the latest packaged release instead of the raw manifest.
        #[arg(long, action = ArgAction::SetTrue)]
        release: bool,
    },
    /// Download the latest release and hand off to a detached executor.
    Update {
        /// Skip the confirmation prompt.
        #[arg(long, action = ArgAction::SetTrue)]
        yes: bool,
    },
    /// Apply an already-extracted tree to the install root.
    Apply {
        #[arg(value_name = "STAGED")]
        staged: PathBuf,
    },
    /// Restore protected files from backups left by a failed apply.
    Recover,
    /// Persist the installation's autoUpdate flag.
    AutoUpdate {
        #[arg(value_enum)]
        state: Toggle,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Toggle {
    On,
    Off,
}

impl Command {
    fn label(&self) -> &'static str {
        match self {
            Command::Boot { .. } => "boot",
            Command::Supervise => "supervise",
            Command::Check { .. } => "check",
            Command::Update { .. } => "update",
            Command::Apply { .. } => "apply",
            Command::Recover => "recover",
            Command::AutoUpdate { .. } => "auto-update",
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("[Syn-Till-Core] {}", err);
            err.exit_code()
        }
    }
}

async fn run() -> Result<ExitCode> {
    let cli = Cli::parse();
    let config = SynTillConfig::load_from_optional_path(cli.config.as_deref())?;

    let session_stamp = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
    let log_path = cli.log.clone().unwrap_or_else(|| {
        config
            .log_dir()
            .join(format!("{}_{session_stamp}.log", cli.command.label()))
    });
    let logger = open_logger(log_path, cli.verbose).with_secret(config.remote.token.as_deref());
    logger.info(
        "INIT",
        format!(
            "Syn-Till Core {} awakening ({}).",
            env!("CARGO_PKG_VERSION"),
            cli.command.label()
        ),
    );
    logger.debug(
        "CONFIG",
        format!(
            "install root {}, scratch {}",
            config.install_root().display(),
            config.scratch_dir().display()
        ),
    );

    let code = match &cli.command {
        Command::Boot { yes, no_prompt } => {
            let prompt: Box<dyn Confirm> = if *yes {
                Box::new(FixedDecision(Decision::Proceed))
            } else if *no_prompt || !std::io::stdin().is_terminal() {
                Box::new(FixedDecision(Decision::Decline))
            } else {
                Box::new(TerminalPrompt)
            };
            boot(&config, &logger, prompt.as_ref()).await?
        }
        Command::Supervise => supervise(cli.config.as_deref(), cli.verbose, &logger).await?,
        Command::Check { release } => check(&config, *release).await?,
        Command::Update { yes } => {
            let prompt: Box<dyn Confirm> = if *yes {
                Box::new(FixedDecision(Decision::Proceed))
            } else {
                Box::new(TerminalPrompt)
            };
            update(&config, &logger, prompt.as_ref()).await?
        }
        Command::Apply { staged } => apply(&config, &logger, staged)?,
        Command::Recover => recover(&config, &logger)?,
        Command::AutoUpdate { state } => {
            let enabled = matches!(state, Toggle::On);
            JsonSettingsStore::in_root(&config.install_root()).set_auto_update(enabled)?;
            logger.info("SETTINGS", format!("autoUpdate set to {enabled}"));
            println!("→ autoUpdate = {enabled}");
            ExitCode::SUCCESS
        }
    };

    logger.info("COMPLETE", "Session closed.");
    if let Err(err) = logger.finalize() {
        eprintln!("[Syn-Till-Core] {err}");
    }
    Ok(code)
}

/// A broken log directory must not keep the service from booting.
fn open_logger(path: PathBuf, verbose: bool) -> Logger {
    match Logger::new(Some(path), verbose) {
        Ok(logger) => logger,
        Err(err) => {
            eprintln!("[Syn-Till-Core] {err}; logging to stderr only");
            Logger::new(None, verbose).unwrap_or_else(|_| Logger::silent())
        }
    }
}

async fn boot(config: &SynTillConfig, logger: &Logger, prompt: &dyn Confirm) -> Result<ExitCode> {
    match run_gate(config, logger, prompt).await {
        Ok(GateOutcome::Restart(exit)) => return Ok(exit.exit_code()),
        Ok(GateOutcome::Continue { .. }) => {}
        Err(err @ SynTillError::Apply { .. }) => return Err(err),
        Err(err) => logger.warn("GATE", format!("Startup gate unavailable: {err}")),
    }
    launch_service(config, logger).await
}

async fn run_gate(
    config: &SynTillConfig,
    logger: &Logger,
    prompt: &dyn Confirm,
) -> Result<GateOutcome> {
    let root = config.install_root();
    let oracle = VersionOracle::new(config)?;
    let fetcher = ArtifactFetcher::new(config)?;
    let planner = UpdatePlanner::new(ProtectedFileSet::standard());
    let settings = JsonSettingsStore::in_root(&root);
    let gate = StartupGate {
        install_root: &root,
        oracle: &oracle,
        fetcher: &fetcher,
        planner: &planner,
        settings: &settings,
        prompt,
        logger,
    };
    gate.run().await
}

async fn launch_service(config: &SynTillConfig, logger: &Logger) -> Result<ExitCode> {
    let Some(command) = config.launch.command.as_deref() else {
        logger.info("LAUNCH", "No service command configured; gate complete");
        return Ok(ExitCode::SUCCESS);
    };
    logger.info("LAUNCH", format!("Starting service: {command}"));
    let status = tokio::process::Command::new(command)
        .args(&config.launch.args)
        .current_dir(config.install_root())
        .status()
        .await
        .map_err(|err| SynTillError::Runtime(format!("Failed to start {command}: {err}")))?;
    logger.info("LAUNCH", format!("Service exited with {status}"));
    Ok(exit_code_of(status.code()))
}

async fn supervise(config_path: Option<&Path>, verbose: bool, logger: &Logger) -> Result<ExitCode> {
    let exe = std::env::current_exe()?;
    loop {
        let mut command = tokio::process::Command::new(&exe);
        if let Some(path) = config_path {
            command.arg("--config").arg(path);
        }
        if verbose {
            command.arg("--verbose");
        }
        command.arg("boot");

        let status = command.status().await.map_err(|err| {
            SynTillError::Runtime(format!("Failed to launch {}: {err}", exe.display()))
        })?;
        match status.code() {
            Some(code) if code == i32::from(RESTART_EXIT_STATUS) => {
                logger.info("SUPERVISE", "Restart requested; re-running boot");
            }
            other => {
                logger.info("SUPERVISE", format!("Boot exited with {status}; stopping"));
                return Ok(exit_code_of(other));
            }
        }
    }
}

fn exit_code_of(code: Option<i32>) -> ExitCode {
    match code {
        Some(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        None => ExitCode::FAILURE,
    }
}

async fn check(config: &SynTillConfig, release: bool) -> Result<ExitCode> {
    let oracle = VersionOracle::new(config)?;
    let descriptor = if release {
        oracle.check_for_updates().await?
    } else {
        oracle.check_remote_version().await
    };
    print_descriptor(&descriptor);
    Ok(ExitCode::SUCCESS)
}

async fn update(config: &SynTillConfig, logger: &Logger, prompt: &dyn Confirm) -> Result<ExitCode> {
    let root = config.install_root();
    let marker = PendingUpdateMarker::in_root(&root);
    if marker.exists() {
        return Err(SynTillError::Handoff(format!(
            "A staged update is already pending at {}; run `boot` to apply it first",
            marker.path().display()
        )));
    }

    let oracle = VersionOracle::new(config)?;
    let fetcher = ArtifactFetcher::new(config)?;
    let mut handoff = ProcessHandoff::new();

    handoff.advance(HandoffState::Checking)?;
    let descriptor = oracle.check_for_updates().await?;
    print_descriptor(&descriptor);
    if !descriptor.has_update {
        return Ok(ExitCode::SUCCESS);
    }
    if prompt.confirm(&descriptor) == Decision::Decline {
        logger.info("UPDATE", "Update declined by operator");
        println!("→ Update declined.");
        return Ok(ExitCode::SUCCESS);
    }

    let staged = fetcher.fetch(&descriptor, logger).await?;
    handoff.advance(HandoffState::Staged)?;
    let protected = ProtectedFileSet::standard();
    let plan = ExecutorPlan {
        install_root: &root,
        staged: &staged,
        protected: &protected,
        launch: &config.launch,
        settle: Duration::from_secs(EXECUTOR_SETTLE_SECS),
    };
    match handoff.immediate(&plan, logger) {
        Ok(exit) => {
            println!("→ Update handed to the executor; this process will now exit.");
            Ok(exit.exit_code())
        }
        Err(err) => {
            if let Err(cleanup) = std::fs::remove_dir_all(&staged.scratch_dir) {
                logger.warn(
                    "UPDATE",
                    format!(
                        "Could not remove scratch {}: {cleanup}",
                        staged.scratch_dir.display()
                    ),
                );
            }
            Err(err)
        }
    }
}

fn apply(config: &SynTillConfig, logger: &Logger, staged: &Path) -> Result<ExitCode> {
    let root = config.install_root();
    let scratch_dir = config.scratch_dir();
    let staged = StagedArtifact {
        extracted_path: std::path::absolute(staged)?,
        archive_path: scratch_dir.join("snapshot.zip"),
        scratch_dir,
    };
    let planner = UpdatePlanner::new(ProtectedFileSet::standard());
    let report = planner.apply(&staged, &root, logger)?;

    let marker = PendingUpdateMarker::in_root(&root);
    if marker.read()?.as_deref() == Some(staged.extracted_path.as_path()) {
        marker.clear()?;
    }
    println!(
        "→ Applied {} file(s); {} protected file(s) preserved.",
        report.files_written,
        report.protected_restored.len()
    );
    Ok(ExitCode::SUCCESS)
}

fn recover(config: &SynTillConfig, logger: &Logger) -> Result<ExitCode> {
    let planner = UpdatePlanner::new(ProtectedFileSet::standard());
    let restored = planner.recover(&config.install_root(), logger)?;
    if restored.is_empty() {
        println!("→ Nothing to recover.");
    }
    for path in restored {
        println!("→ Restored {}", path.display());
    }
    Ok(ExitCode::SUCCESS)
}

fn print_descriptor(descriptor: &UpdateDescriptor) {
    let local = descriptor.local_version.as_deref().unwrap_or("unknown");
    match (&descriptor.error, descriptor.remote_version.as_deref()) {
        (Some(err), _) => println!("→ Installed {local}; check failed: {err}"),
        (None, Some(remote)) if descriptor.has_update => {
            println!("→ Update available: {local} → {remote}");
            if let Some(asset) = descriptor.asset_name.as_deref() {
                println!("  asset: {asset}");
            }
            if let Some(notes) = descriptor.release_notes.as_deref() {
                println!("  notes: {}", notes.trim());
            }
        }
        (None, _) => println!("→ Up to date ({local})."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn boot_prompt_flags_conflict() {
        assert!(Cli::try_parse_from(["syntill-core", "boot", "--yes", "--no-prompt"]).is_err());
        let cli = Cli::try_parse_from(["syntill-core", "--verbose", "boot", "--no-prompt"])
            .expect("parse");
        assert!(cli.verbose);
        assert!(matches!(cli.command, Command::Boot { yes: false, no_prompt: true }));
    }

    #[test]
    fn child_status_maps_to_exit_code() {
        let render = |code: ExitCode| format!("{code:?}");
        assert_eq!(render(exit_code_of(Some(2))), render(ExitCode::from(RESTART_EXIT_STATUS)));
        assert_eq!(render(exit_code_of(Some(-1))), render(ExitCode::from(1)));
        assert_eq!(render(exit_code_of(None)), render(ExitCode::FAILURE));
    }
}

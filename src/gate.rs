/*============================================================
  Synavera Project: Syn-Till
  Module: syntill_core::gate
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Run once per boot, before the service binds its socket:
    apply a pending staged update if one exists, otherwise
    perform the passive version check and, on acceptance,
    stage the update and request a restart.

  Security / Safety Notes:
    The passive check can never stop the service from booting;
    its failures are logged and treated as "no update".

  Dependencies:
    Composes version, fetch, planner, marker, handoff,
    settings, and prompt services injected by the caller.

  Operational Scope:
    Invoked by `syntill-core boot`, which the supervising
    launcher re-runs whenever it exits with the restart status.

  Revision History:
    2025-11-12 COD  Authored startup gate.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Marker consumption takes priority over fresh checks
    - Fail-open passive checks, fail-closed applies
============================================================*/

use std::path::Path;

use crate::error::{Result, SynTillError};
use crate::fetch::{ArtifactFetcher, StagedArtifact};
use crate::handoff::{HandoffExit, HandoffState, ProcessHandoff};
use crate::logger::Logger;
use crate::marker::PendingUpdateMarker;
use crate::planner::{ApplyReport, UpdatePlanner};
use crate::prompt::{Confirm, Decision};
use crate::settings::SettingsStore;
use crate::version::VersionOracle;

/// What the boot sequence should do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateOutcome {
    /// Start serving. Carries the report when a pending update was applied.
    Continue { applied: Option<ApplyReport> },
    /// Stop here and exit with the handoff's status.
    Restart(HandoffExit),
}

impl GateOutcome {
    fn proceed() -> Self {
        GateOutcome::Continue { applied: None }
    }
}

pub struct StartupGate<'a> {
    pub install_root: &'a Path,
    pub oracle: &'a VersionOracle,
    pub fetcher: &'a ArtifactFetcher,
    pub planner: &'a UpdatePlanner,
    pub settings: &'a dyn SettingsStore,
    pub prompt: &'a dyn Confirm,
    pub logger: &'a Logger,
}

impl StartupGate<'_> {
    pub async fn run(&self) -> Result<GateOutcome> {
        let marker = PendingUpdateMarker::in_root(self.install_root);
        let mut handoff = ProcessHandoff::new();

        if marker.exists() {
            return self.consume_marker(&marker, &mut handoff);
        }

        match self.check_and_stage(&marker, &mut handoff).await {
            Ok(outcome) => Ok(outcome),
            Err(err) => {
                self.logger.warn(
                    "GATE",
                    format!("Update check skipped, continuing boot: {err}"),
                );
                Ok(GateOutcome::proceed())
            }
        }
    }

    fn consume_marker(
        &self,
        marker: &PendingUpdateMarker,
        handoff: &mut ProcessHandoff,
    ) -> Result<GateOutcome> {
        let extracted_path = match marker.read() {
            Ok(Some(path)) => path,
            Ok(None) => return Ok(GateOutcome::proceed()),
            Err(err) => {
                self.logger.error("GATE", format!("Discarding unreadable marker: {err}"));
                marker.clear()?;
                return Ok(GateOutcome::proceed());
            }
        };
        self.logger.info(
            "GATE",
            format!("Pending update found at {}", extracted_path.display()),
        );
        handoff.advance(HandoffState::Applying)?;

        let staged = StagedArtifact {
            scratch_dir: self.fetcher.scratch_dir().to_path_buf(),
            archive_path: self.fetcher.scratch_dir().join("snapshot.zip"),
            extracted_path,
        };
        let report = match self.planner.apply(&staged, self.install_root, self.logger) {
            Ok(report) => report,
            Err(err @ SynTillError::ArtifactIntegrity(_)) => {
                // Nothing was touched; a vanished staged tree must not wedge every boot.
                self.logger.error("GATE", format!("Discarding pending update: {err}"));
                marker.clear()?;
                return Ok(GateOutcome::proceed());
            }
            Err(err) => {
                self.logger.error(
                    "GATE",
                    format!("Pending update failed to apply; marker kept for retry: {err}"),
                );
                return Err(err);
            }
        };

        marker.clear()?;
        handoff.advance(HandoffState::Restarting)?;
        handoff.advance(HandoffState::Idle)?;
        self.logger.info(
            "GATE",
            format!(
                "Pending update applied ({} files); continuing boot",
                report.files_written
            ),
        );
        Ok(GateOutcome::Continue {
            applied: Some(report),
        })
    }

    async fn check_and_stage(
        &self,
        marker: &PendingUpdateMarker,
        handoff: &mut ProcessHandoff,
    ) -> Result<GateOutcome> {
        if self.settings.auto_update()? == Some(false) {
            self.logger.info("GATE", "Auto-update disabled; skipping check");
            return Ok(GateOutcome::proceed());
        }

        handoff.advance(HandoffState::Checking)?;
        let descriptor = self.oracle.check_remote_version().await;
        if let Some(err) = descriptor.error.as_deref() {
            self.logger.warn("CHECK", format!("Version check failed: {err}"));
        }
        if !descriptor.has_update {
            handoff.advance(HandoffState::Idle)?;
            self.logger.info("CHECK", "No update available");
            return Ok(GateOutcome::proceed());
        }

        self.logger.info(
            "CHECK",
            format!(
                "Update available: {} → {}",
                descriptor.local_version.as_deref().unwrap_or("unknown"),
                descriptor.remote_version.as_deref().unwrap_or("unknown")
            ),
        );
        if self.prompt.confirm(&descriptor) == Decision::Decline {
            handoff.advance(HandoffState::Idle)?;
            self.logger.info("CHECK", "Update declined by operator");
            return Ok(GateOutcome::proceed());
        }

        let staged = self.fetcher.fetch(&descriptor, self.logger).await?;
        handoff.advance(HandoffState::Staged)?;
        match handoff.defer(marker, &staged, self.logger) {
            Ok(exit) => Ok(GateOutcome::Restart(exit)),
            Err(err) => {
                if let Err(cleanup) = std::fs::remove_dir_all(&staged.scratch_dir) {
                    self.logger.warn(
                        "GATE",
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
}

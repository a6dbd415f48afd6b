/*============================================================
  Synavera Project: Syn-Till
  Module: syntill_core::error
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Centralise Syn-Till-Core error types so update checks,
    fetches, applies, and handoffs share one failure taxonomy
    and one set of exit semantics.

  Security / Safety Notes:
    Error contexts never embed the remote bearer credential;
    only URLs and install-relative paths are exposed.

  Dependencies:
    thiserror for ergonomic error definitions.

  Operational Scope:
    Used across modules to propagate recoverable failures and
    consolidate exit codes for the binary entry point.

  Revision History:
    2025-11-12 COD  Reworked taxonomy for the self-update path.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Explicit error taxonomy with actionable context
    - No silent failure paths
    - Stable exit codes for operational tooling
============================================================*/

use std::io;
use std::path::PathBuf;
use std::process::ExitCode;

use thiserror::Error;

/// Result alias for Syn-Till-Core operations.
pub type Result<T> = std::result::Result<T, SynTillError>;

/// Exit status reserved for "update staged, restart me via the launcher".
pub const RESTART_EXIT_STATUS: u8 = 2;

/// Enumerates high-level error domains surfaced by Syn-Till-Core.
#[derive(Debug, Error)]
pub enum SynTillError {
    #[error("Network: {0}")]
    Network(String),
    #[error("Parse: {0}")]
    Parse(String),
    #[error("Artifact integrity: {0}")]
    ArtifactIntegrity(String),
    #[error("Apply: {message}{}", backup_hint(.backups))]
    Apply {
        message: String,
        backups: Vec<PathBuf>,
    },
    #[error("Handoff: {0}")]
    Handoff(String),
    #[error("Configuration: {0}")]
    Config(String),
    #[error("Filesystem: {0}")]
    Filesystem(String),
    #[error("Runtime: {0}")]
    Runtime(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl SynTillError {
    /// Map error category to a deterministic exit code.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            SynTillError::Config(_) => ExitCode::from(20),
            SynTillError::Network(_) => ExitCode::from(30),
            SynTillError::Parse(_) => ExitCode::from(31),
            SynTillError::ArtifactIntegrity(_) => ExitCode::from(32),
            SynTillError::Filesystem(_) => ExitCode::from(40),
            SynTillError::Io(_) => ExitCode::from(41),
            SynTillError::Apply { .. } => ExitCode::from(42),
            SynTillError::Handoff(_) => ExitCode::from(45),
            SynTillError::Runtime(_) => ExitCode::from(50),
        }
    }
}

fn backup_hint(backups: &[PathBuf]) -> String {
    if backups.is_empty() {
        return String::new();
    }
    let listed: Vec<String> = backups
        .iter()
        .map(|path| path.display().to_string())
        .collect();
    format!(" (protected backups kept at: {})", listed.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn apply_error_names_preserved_backups() {
        let err = SynTillError::Apply {
            message: "overlay failed".into(),
            backups: vec![PathBuf::from("/srv/pos/.env.syntill-backup")],
        };
        let rendered = err.to_string();
        assert!(rendered.contains("overlay failed"));
        assert!(rendered.contains("/srv/pos/.env.syntill-backup"));
    }

    #[test]
    fn apply_error_without_backups_has_no_hint() {
        let err = SynTillError::Apply {
            message: "scratch cleanup failed".into(),
            backups: Vec::new(),
        };
        assert_eq!(err.to_string(), "Apply: scratch cleanup failed");
    }
}

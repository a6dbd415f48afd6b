/*============================================================
  Synavera Project: Syn-Till
  Module: syntill_core::marker
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1
  ------------------------------------------------------------
  Purpose:
    Persist the "staged update awaiting apply" marker that
    carries a deferred update across a process restart.

  Security / Safety Notes:
    The marker holds only an absolute scratch path. It is
    created exclusively, so two staged updates cannot race.

  Dependencies:
    std::fs only.

  Operational Scope:
    Written by the deferred-apply handoff, consumed by the
    startup gate on the next boot.

  Revision History:
    2025-11-12 COD  Authored pending-update marker.
============================================================*/

use std::fs::OpenOptions;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::{Result, SynTillError};

pub const MARKER_FILE: &str = ".syntill-pending-update";

/// Single persisted record whose presence means a staged update must be
/// applied before serving traffic.
#[derive(Debug, Clone)]
pub struct PendingUpdateMarker {
    path: PathBuf,
}

impl PendingUpdateMarker {
    pub fn in_root(install_root: &Path) -> Self {
        Self {
            path: install_root.join(MARKER_FILE),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    /// Record `staged_path`. Fails if a marker is already present.
    pub fn create(&self, staged_path: &Path) -> Result<()> {
        let absolute = std::path::absolute(staged_path)?;
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .map_err(|err| match err.kind() {
                io::ErrorKind::AlreadyExists => SynTillError::Handoff(format!(
                    "A staged update is already pending at {}",
                    self.path.display()
                )),
                _ => SynTillError::Filesystem(format!(
                    "Failed to create marker {}: {err}",
                    self.path.display()
                )),
            })?;
        writeln!(file, "{}", absolute.display())?;
        file.sync_all()?;
        Ok(())
    }

    /// Staged path recorded by the marker, or `None` when absent.
    pub fn read(&self) -> Result<Option<PathBuf>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(SynTillError::Filesystem(format!(
                    "Failed to read marker {}: {err}",
                    self.path.display()
                )))
            }
        };
        let staged = raw.trim();
        if staged.is_empty() {
            return Err(SynTillError::Parse(format!(
                "Marker {} is empty",
                self.path.display()
            )));
        }
        Ok(Some(PathBuf::from(staged)))
    }

    pub fn clear(&self) -> Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(SynTillError::Filesystem(format!(
                "Failed to remove marker {}: {err}",
                self.path.display()
            ))),
        }
    }
}

/*============================================================
  Synavera Project: Syn-Till
  Module: syntill_core::planner
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Turn a staged tree into the live installation: back up
    the protected files, overlay the new tree, restore the
    protected files, then clear scratch storage.

  Security / Safety Notes:
    Secrets and local settings are never lost: on any failure
    after backups are taken, the backups stay on disk and are
    named in the error for manual or `recover` restoration.

  Dependencies:
    walkdir for tree traversal; std::fs for copies.

  Operational Scope:
    Used by the startup gate when consuming a pending marker,
    and by the `apply` and `recover` subcommands.

  Revision History:
    2025-11-12 COD  Authored update planner/applier.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Strict backup → overlay → restore ordering
    - Copy, never move, before the overlay
    - Backups outlive every partial failure
============================================================*/

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use walkdir::WalkDir;

use crate::error::{Result, SynTillError};
use crate::fetch::StagedArtifact;
use crate::logger::Logger;
use crate::settings::SETTINGS_FILE;

/// Suffix appended to a protected file's name while an apply is in flight.
pub const BACKUP_SUFFIX: &str = ".syntill-backup";

/// Install-relative paths that keep their pre-update content.
const PROTECTED_FILES: &[&str] = &[".env", SETTINGS_FILE];

/// Paths guaranteed to retain their content across an overlay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtectedFileSet {
    paths: Vec<PathBuf>,
}

impl ProtectedFileSet {
    /// The fixed set shipped with this build.
    pub fn standard() -> Self {
        Self {
            paths: PROTECTED_FILES.iter().map(PathBuf::from).collect(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &Path> {
        self.paths.iter().map(PathBuf::as_path)
    }
}

/// Same directory, derived name: `.env` → `.env.syntill-backup`.
pub fn backup_path(original: &Path) -> PathBuf {
    let mut name: OsString = original.as_os_str().to_os_string();
    name.push(BACKUP_SUFFIX);
    PathBuf::from(name)
}

/// Summary of a completed apply.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub files_written: usize,
    pub protected_restored: Vec<PathBuf>,
}

#[derive(Debug)]
struct Backup {
    original: PathBuf,
    copy: PathBuf,
    /// Taken by this apply rather than left over from an earlier one.
    fresh: bool,
}

pub struct UpdatePlanner {
    protected: ProtectedFileSet,
}

impl UpdatePlanner {
    pub fn new(protected: ProtectedFileSet) -> Self {
        Self { protected }
    }

    pub fn protected(&self) -> &ProtectedFileSet {
        &self.protected
    }

    /// Replace the live tree at `install_root` with the staged tree.
    pub fn apply(
        &self,
        staged: &StagedArtifact,
        install_root: &Path,
        logger: &Logger,
    ) -> Result<ApplyReport> {
        if !staged.extracted_path.is_dir() {
            return Err(SynTillError::ArtifactIntegrity(format!(
                "Staged tree {} does not exist",
                staged.extracted_path.display()
            )));
        }

        let backups = self.take_backups(install_root, logger)?;
        logger.info(
            "APPLY",
            format!("Backed up {} protected file(s)", backups.len()),
        );

        let files_written = overlay(&staged.extracted_path, install_root)
            .map_err(|message| apply_failure(message, &backups))?;
        logger.info(
            "APPLY",
            format!(
                "Overlaid {files_written} file(s) from {} onto {}",
                staged.extracted_path.display(),
                install_root.display()
            ),
        );

        let protected_restored = restore_backups(&backups)?;
        logger.info(
            "APPLY",
            format!("Restored {} protected file(s)", protected_restored.len()),
        );

        match fs::remove_dir_all(&staged.scratch_dir) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => logger.warn(
                "APPLY",
                format!(
                    "Update applied but scratch {} could not be removed: {err}",
                    staged.scratch_dir.display()
                ),
            ),
        }

        Ok(ApplyReport {
            files_written,
            protected_restored,
        })
    }

    /// Restore protected files from backups left behind by a failed apply.
    pub fn recover(&self, install_root: &Path, logger: &Logger) -> Result<Vec<PathBuf>> {
        let backups: Vec<Backup> = self
            .protected
            .iter()
            .map(|relative| install_root.join(relative))
            .map(|original| Backup {
                copy: backup_path(&original),
                original,
                fresh: false,
            })
            .filter(|backup| backup.copy.is_file())
            .collect();
        if backups.is_empty() {
            logger.info("RECOVER", "No protected-file backups found");
            return Ok(Vec::new());
        }
        let restored = restore_backups(&backups)?;
        for path in &restored {
            logger.info("RECOVER", format!("Restored {}", path.display()));
        }
        Ok(restored)
    }

    /// A backup already on disk is left by an earlier failed apply and holds
    /// the true pre-update content, so it is kept rather than re-copied.
    fn take_backups(&self, install_root: &Path, logger: &Logger) -> Result<Vec<Backup>> {
        let mut taken = Vec::new();
        for relative in self.protected.iter() {
            let original = install_root.join(relative);
            let copy = backup_path(&original);
            if copy.is_file() {
                logger.warn(
                    "APPLY",
                    format!("Reusing backup {} from an earlier apply", copy.display()),
                );
                taken.push(Backup {
                    original,
                    copy,
                    fresh: false,
                });
                continue;
            }
            if !original.is_file() {
                continue;
            }
            if let Err(err) = fs::copy(&original, &copy) {
                // Nothing overlaid yet, so copies taken this run are redundant.
                let mut leftovers: Vec<PathBuf> = Vec::new();
                for backup in &taken {
                    if !backup.fresh {
                        leftovers.push(backup.copy.clone());
                        continue;
                    }
                    if let Err(remove_err) = fs::remove_file(&backup.copy) {
                        logger.warn(
                            "APPLY",
                            format!(
                                "Could not remove backup {}: {remove_err}",
                                backup.copy.display()
                            ),
                        );
                        leftovers.push(backup.copy.clone());
                    }
                }
                return Err(SynTillError::Apply {
                    message: format!("Failed to back up {}: {err}", original.display()),
                    backups: leftovers,
                });
            }
            taken.push(Backup {
                original,
                copy,
                fresh: true,
            });
        }
        Ok(taken)
    }
}

fn apply_failure(message: String, backups: &[Backup]) -> SynTillError {
    SynTillError::Apply {
        message,
        backups: backups.iter().map(|backup| backup.copy.clone()).collect(),
    }
}

/// Copy every file under `source` onto `dest`, overwriting same-path files.
/// Files present only in `dest` are left alone.
fn overlay(source: &Path, dest: &Path) -> std::result::Result<usize, String> {
    let mut written = 0usize;
    for entry in WalkDir::new(source).min_depth(1) {
        let entry = entry.map_err(|err| format!("Failed to walk staged tree: {err}"))?;
        let relative = entry
            .path()
            .strip_prefix(source)
            .map_err(|err| format!("Staged entry outside tree: {err}"))?;
        let target = dest.join(relative);

        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)
                .map_err(|err| format!("Failed to create {}: {err}", target.display()))?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .map_err(|err| format!("Failed to create {}: {err}", parent.display()))?;
        }
        fs::copy(entry.path(), &target).map_err(|err| {
            format!(
                "Failed to copy {} over {}: {err}",
                entry.path().display(),
                target.display()
            )
        })?;
        written += 1;
    }
    Ok(written)
}

/// Copy each backup over its original, then delete the backup. Backups not
/// yet restored stay on disk if this fails partway.
fn restore_backups(backups: &[Backup]) -> Result<Vec<PathBuf>> {
    let mut restored = Vec::with_capacity(backups.len());
    for (index, backup) in backups.iter().enumerate() {
        let copied = backup
            .original
            .parent()
            .map_or(Ok(()), fs::create_dir_all)
            .and_then(|_| fs::copy(&backup.copy, &backup.original));
        if let Err(err) = copied {
            return Err(apply_failure(
                format!("Failed to restore {}: {err}", backup.original.display()),
                &backups[index..],
            ));
        }
        if let Err(err) = fs::remove_file(&backup.copy) {
            return Err(apply_failure(
                format!(
                    "Restored {} but could not remove its backup: {err}",
                    backup.original.display()
                ),
                &backups[index..],
            ));
        }
        restored.push(backup.original.clone());
    }
    Ok(restored)
}

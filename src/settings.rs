/*============================================================
  Synavera Project: Syn-Till
  Module: syntill_core::settings
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1
  ------------------------------------------------------------
  Purpose:
    Read and write the installation's persisted `autoUpdate`
    flag, which the application owns and the updater obeys.

  Security / Safety Notes:
    Unknown keys in the settings document are preserved on
    write; only `autoUpdate` is touched.

  Dependencies:
    serde_json for the settings document.

  Revision History:
    2025-11-12 COD  Authored settings store adapter.
============================================================*/

use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Map, Value};

use crate::error::{Result, SynTillError};

pub const SETTINGS_FILE: &str = "settings.json";
const AUTO_UPDATE_KEY: &str = "autoUpdate";

/// The application's configuration store, as seen by the updater.
pub trait SettingsStore {
    /// `None` when the flag was never set.
    fn auto_update(&self) -> Result<Option<bool>>;
}

/// `settings.json` at the install root.
pub struct JsonSettingsStore {
    path: PathBuf,
}

impl JsonSettingsStore {
    pub fn in_root(install_root: &Path) -> Self {
        Self {
            path: install_root.join(SETTINGS_FILE),
        }
    }

    fn load(&self) -> Result<Option<Map<String, Value>>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(SynTillError::Filesystem(format!(
                    "Failed to read settings {}: {err}",
                    self.path.display()
                )))
            }
        };
        let trimmed = raw.trim_start_matches('\u{feff}');
        match serde_json::from_str::<Value>(trimmed) {
            Ok(Value::Object(map)) => Ok(Some(map)),
            Ok(_) => Err(SynTillError::Parse(format!(
                "Settings {} is not a JSON object",
                self.path.display()
            ))),
            Err(err) => Err(SynTillError::Parse(format!(
                "Malformed settings {}: {err}",
                self.path.display()
            ))),
        }
    }

    pub fn set_auto_update(&self, enabled: bool) -> Result<()> {
        let mut document = self.load()?.unwrap_or_default();
        document.remove("auto_update");
        document.insert(AUTO_UPDATE_KEY.into(), Value::Bool(enabled));
        let rendered = serde_json::to_string_pretty(&Value::Object(document))
            .map_err(|err| SynTillError::Parse(format!("Failed to encode settings: {err}")))?;
        std::fs::write(&self.path, rendered).map_err(|err| {
            SynTillError::Filesystem(format!(
                "Failed to write settings {}: {err}",
                self.path.display()
            ))
        })
    }
}

impl SettingsStore for JsonSettingsStore {
    fn auto_update(&self) -> Result<Option<bool>> {
        let Some(document) = self.load()? else {
            return Ok(None);
        };
        let value = document
            .get(AUTO_UPDATE_KEY)
            .or_else(|| document.get("auto_update"));
        match value {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Bool(flag)) => Ok(Some(*flag)),
            Some(Value::String(text)) => match text.as_str() {
                "true" => Ok(Some(true)),
                "false" => Ok(Some(false)),
                other => Err(SynTillError::Parse(format!(
                    "autoUpdate must be a boolean, found `{other}`"
                ))),
            },
            Some(other) => Err(SynTillError::Parse(format!(
                "autoUpdate must be a boolean, found `{other}`"
            ))),
        }
    }
}

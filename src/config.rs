/*============================================================
  Synavera Project: Syn-Till
  Module: syntill_core::config
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Load and validate the TOML configuration that tells the
    updater where the installation lives, where new versions
    are published, and how to relaunch the service.

  Security / Safety Notes:
    The optional bearer token may come from the file or from
    SYNTILL_TOKEN; it is never echoed by Debug output.

  Dependencies:
    serde + toml for parsing, dirs for XDG defaults.

  Operational Scope:
    Loaded once per invocation by the binary entry point and
    injected into every update service.

  Revision History:
    2025-11-12 COD  Authored configuration layer.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Explicit defaults for every tunable
    - Validation at load time, not at use time
============================================================*/

use std::fmt;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Result, SynTillError};

const TOKEN_ENV: &str = "SYNTILL_TOKEN";

/// Root configuration document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SynTillConfig {
    pub install: InstallConfig,
    pub remote: RemoteConfig,
    pub launch: LaunchConfig,
    pub logging: LoggingConfig,
}

/// Where the live installation and its scratch space live.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstallConfig {
    pub root: PathBuf,
    pub manifest_file: String,
    pub scratch_dir: Option<PathBuf>,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            manifest_file: "manifest.json".into(),
            scratch_dir: None,
        }
    }
}

/// Remote publication endpoints.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub manifest_url: Option<String>,
    pub snapshot_url: Option<String>,
    pub api_base: String,
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub token: Option<String>,
    pub timeout: u64,
    pub asset_extension: String,
    pub user_agent: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            manifest_url: None,
            snapshot_url: None,
            api_base: "https://api.github.com".into(),
            owner: None,
            repo: None,
            token: None,
            timeout: 10,
            asset_extension: ".zip".into(),
            user_agent: format!("Syn-Till-Core/{} (updater)", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("manifest_url", &self.manifest_url)
            .field("snapshot_url", &self.snapshot_url)
            .field("api_base", &self.api_base)
            .field("owner", &self.owner)
            .field("repo", &self.repo)
            .field("token", &self.token.as_ref().map(|_| "[redacted]"))
            .field("timeout", &self.timeout)
            .field("asset_extension", &self.asset_extension)
            .finish()
    }
}

impl RemoteConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    /// URL of the "latest packaged release" metadata endpoint, if configured.
    pub fn latest_release_url(&self) -> Option<String> {
        let owner = self.owner.as_deref()?;
        let repo = self.repo.as_deref()?;
        Some(format!(
            "{}/repos/{}/{}/releases/latest",
            self.api_base.trim_end_matches('/'),
            urlencoding::encode(owner),
            urlencoding::encode(repo)
        ))
    }
}

/// How the service entry point is relaunched.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LaunchConfig {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub dependency_command: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_dir: Option<PathBuf>,
}

impl SynTillConfig {
    /// Load from an explicit path, or from the default location when absent.
    ///
    /// An explicit path that does not exist is an error; a missing default
    /// file silently yields defaults.
    pub fn load_from_optional_path(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(explicit) => Self::load_file(explicit)?,
            None => match default_config_path() {
                Some(default) if default.exists() => Self::load_file(&default)?,
                _ => Self::default(),
            },
        };

        if config.remote.token.is_none() {
            config.remote.token = std::env::var(TOKEN_ENV).ok().filter(|t| !t.is_empty());
        }
        config.validate()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            SynTillError::Config(format!(
                "Failed to read configuration {}: {err}",
                path.display()
            ))
        })?;
        Self::from_toml_str(&raw).map_err(|err| match err {
            SynTillError::Config(msg) => {
                SynTillError::Config(format!("{}: {msg}", path.display()))
            }
            other => other,
        })
    }

    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|err| SynTillError::Config(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.remote.asset_extension.trim().is_empty() {
            return Err(SynTillError::Config(
                "remote.asset_extension must not be empty".into(),
            ));
        }
        if self.install.manifest_file.trim().is_empty() {
            return Err(SynTillError::Config(
                "install.manifest_file must not be empty".into(),
            ));
        }
        // The fetcher wipes the scratch dir before every download.
        let root = lexical_normalize(&self.install_root());
        let scratch = lexical_normalize(&self.scratch_dir());
        if root.starts_with(&scratch) {
            return Err(SynTillError::Config(format!(
                "install.scratch_dir {} must not be the install root or one of its parents",
                scratch.display()
            )));
        }
        Ok(())
    }

    pub fn install_root(&self) -> PathBuf {
        std::path::absolute(&self.install.root).unwrap_or_else(|_| self.install.root.clone())
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.install_root().join(&self.install.manifest_file)
    }

    pub fn scratch_dir(&self) -> PathBuf {
        match &self.install.scratch_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => self.install_root().join(dir),
            None => self.install_root().join(".syntill-staging"),
        }
    }

    pub fn log_dir(&self) -> PathBuf {
        self.logging.log_dir.clone().unwrap_or_else(|| {
            dirs::state_dir()
                .or_else(dirs::data_local_dir)
                .unwrap_or_else(std::env::temp_dir)
                .join("syntill")
                .join("logs")
        })
    }
}

/// Resolve `.` and `..` without touching the filesystem.
fn lexical_normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other),
        }
    }
    normalized
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("syntill").join("config.toml"))
}

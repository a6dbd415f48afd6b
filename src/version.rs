/*============================================================
  Synavera Project: Syn-Till
  Module: syntill_core::version
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Decide whether a newer release of the installation has
    been published, either from a raw manifest file or from
    the "latest release" metadata endpoint.

  Security / Safety Notes:
    Read-only HTTPS GETs. The optional bearer credential is
    attached as an Authorization header and nowhere else.

  Dependencies:
    reqwest for HTTP, semver for precedence, serde for parsing.

  Operational Scope:
    Invoked by the startup gate on every boot (passive check)
    and by the `check` / `update` subcommands.

  Revision History:
    2025-11-12 COD  Authored version oracle.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Fail-open passive checks with the cause attached
    - Cache-defeating requests so fresh tags are never masked
    - Strict three-component version parsing
============================================================*/

use std::path::{Path, PathBuf};

use chrono::Utc;
use reqwest::header::{ACCEPT, CACHE_CONTROL, PRAGMA};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::config::SynTillConfig;
use crate::error::{Result, SynTillError};

/// Small metadata file whose relevant field is the version string.
#[derive(Debug, Clone, Deserialize)]
pub struct VersionManifest {
    pub version: String,
}

/// Where the new tree can be downloaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArtifactSource {
    /// Archive of the raw source tree, wrapped in one generated directory.
    Snapshot { url: String },
    /// Packaged, ready-to-run release asset.
    Release { download_url: String },
}

/// Outcome of a version check. Immutable once produced.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateDescriptor {
    pub has_update: bool,
    pub local_version: Option<String>,
    pub remote_version: Option<String>,
    pub source: Option<ArtifactSource>,
    pub release_notes: Option<String>,
    pub asset_name: Option<String>,
    pub error: Option<String>,
}

impl UpdateDescriptor {
    fn failed(local_version: Option<String>, err: SynTillError) -> Self {
        Self {
            local_version,
            error: Some(err.to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Deserialize)]
struct ReleaseMetadata {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    assets: Vec<ReleaseAsset>,
}

#[derive(Debug, Deserialize)]
struct ReleaseAsset {
    name: String,
    browser_download_url: String,
}

/// Parse a `major.minor.patch` string, tolerating a leading `v`.
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    Version::parse(trimmed)
        .map_err(|err| SynTillError::Parse(format!("Invalid version `{raw}`: {err}")))
}

/// True iff `remote` strictly exceeds `local` on major, minor, then patch.
pub fn is_newer(local: &Version, remote: &Version) -> bool {
    (remote.major, remote.minor, remote.patch) > (local.major, local.minor, local.patch)
}

/// Read the installation's own manifest.
pub fn read_local_version(manifest_path: &Path) -> Result<Version> {
    let raw = std::fs::read_to_string(manifest_path).map_err(|err| {
        SynTillError::Filesystem(format!(
            "Failed to read local manifest {}: {err}",
            manifest_path.display()
        ))
    })?;
    let manifest: VersionManifest = serde_json::from_str(&raw).map_err(|err| {
        SynTillError::Parse(format!(
            "Malformed local manifest {}: {err}",
            manifest_path.display()
        ))
    })?;
    parse_version(&manifest.version)
}

/// Compares the installed version against what is published remotely.
#[derive(Clone)]
pub struct VersionOracle {
    client: reqwest::Client,
    manifest_path: PathBuf,
    manifest_url: Option<String>,
    snapshot_url: Option<String>,
    release_url: Option<String>,
    token: Option<String>,
    asset_extension: String,
}

impl VersionOracle {
    pub fn new(config: &SynTillConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.remote.timeout())
            .user_agent(config.remote.user_agent.clone())
            .build()
            .map_err(|err| SynTillError::Network(format!("Failed to build HTTP client: {err}")))?;

        let snapshot_url = config.remote.snapshot_url.clone().or_else(|| {
            let owner = config.remote.owner.as_deref()?;
            let repo = config.remote.repo.as_deref()?;
            Some(format!(
                "{}/repos/{}/{}/zipball",
                config.remote.api_base.trim_end_matches('/'),
                urlencoding::encode(owner),
                urlencoding::encode(repo)
            ))
        });

        Ok(Self {
            client,
            manifest_path: config.manifest_path(),
            manifest_url: config.remote.manifest_url.clone(),
            snapshot_url,
            release_url: config.remote.latest_release_url(),
            token: config.remote.token.clone(),
            asset_extension: config.remote.asset_extension.clone(),
        })
    }

    pub fn local_version(&self) -> Result<Version> {
        read_local_version(&self.manifest_path)
    }

    /// Raw-manifest check. Never fails: any error is attached to a
    /// descriptor reporting no update.
    pub async fn check_remote_version(&self) -> UpdateDescriptor {
        let local = match self.local_version() {
            Ok(version) => version,
            Err(err) => return UpdateDescriptor::failed(None, err),
        };
        let local_str = Some(local.to_string());

        let remote = match self.fetch_manifest_version().await {
            Ok(version) => version,
            Err(err) => return UpdateDescriptor::failed(local_str, err),
        };

        let has_update = is_newer(&local, &remote);
        UpdateDescriptor {
            has_update,
            local_version: local_str,
            remote_version: Some(remote.to_string()),
            source: self
                .snapshot_url
                .clone()
                .map(|url| ArtifactSource::Snapshot { url }),
            ..UpdateDescriptor::default()
        }
    }

    /// Latest-release check. An update without an installable asset is
    /// reported as an artifact integrity failure.
    pub async fn check_for_updates(&self) -> Result<UpdateDescriptor> {
        let local = self.local_version()?;
        let url = self.release_url.as_deref().ok_or_else(|| {
            SynTillError::Config("remote.owner and remote.repo are required for release checks".into())
        })?;

        let response = self.get(url).await?;
        let release: ReleaseMetadata = response.json().await.map_err(|err| {
            SynTillError::Parse(format!("Failed to decode release metadata from {url}: {err}"))
        })?;
        let remote = parse_version(&release.tag_name)?;

        let mut descriptor = UpdateDescriptor {
            has_update: is_newer(&local, &remote),
            local_version: Some(local.to_string()),
            remote_version: Some(remote.to_string()),
            release_notes: release.body.clone(),
            ..UpdateDescriptor::default()
        };
        if !descriptor.has_update {
            return Ok(descriptor);
        }

        let asset = release
            .assets
            .into_iter()
            .find(|asset| asset.name.ends_with(&self.asset_extension))
            .ok_or_else(|| {
                SynTillError::ArtifactIntegrity(format!(
                    "Release {} ({}) has no `{}` asset; update exists but no installable artifact",
                    release.tag_name,
                    release.name.as_deref().unwrap_or("unnamed"),
                    self.asset_extension
                ))
            })?;
        descriptor.asset_name = Some(asset.name);
        descriptor.source = Some(ArtifactSource::Release {
            download_url: asset.browser_download_url,
        });
        Ok(descriptor)
    }

    async fn fetch_manifest_version(&self) -> Result<Version> {
        let url = self.manifest_url.as_deref().ok_or_else(|| {
            SynTillError::Config("remote.manifest_url is not configured".into())
        })?;
        let response = self.get(url).await?;
        let manifest: VersionManifest = response.json().await.map_err(|err| {
            SynTillError::Parse(format!("Malformed remote manifest from {url}: {err}"))
        })?;
        parse_version(&manifest.version)
    }

    async fn get(&self, url: &str) -> Result<reqwest::Response> {
        let cache_bust = Utc::now().timestamp_millis().to_string();
        let mut request = self
            .client
            .get(url)
            .query(&[("t", cache_bust.as_str())])
            .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
            .header(PRAGMA, "no-cache")
            .header(ACCEPT, "application/vnd.github+json, application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|err| SynTillError::Network(format!("GET {url} failed: {err}")))?;
        if !response.status().is_success() {
            return Err(SynTillError::Network(format!(
                "GET {url} returned status {}",
                response.status()
            )));
        }
        Ok(response)
    }
}

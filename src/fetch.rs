/*============================================================
  Synavera Project: Syn-Till
  Module: syntill_core::fetch
  Etiquette: Synavera Script Etiquette — Rust Profile v1.1.1
  ------------------------------------------------------------
  Purpose:
    Retrieve a published archive (source snapshot or packaged
    release asset), stream it to scratch storage, and extract
    it into a staged tree ready for the planner.

  Security / Safety Notes:
    Archive entries that would escape the extraction root are
    rejected. Any failure removes the whole scratch directory.

  Dependencies:
    reqwest for streamed downloads, zip for extraction,
    tokio for async file I/O and blocking offload.

  Operational Scope:
    Called by the startup gate (snapshot, deferred apply) and
    the `update` subcommand (release asset, immediate apply).

  Revision History:
    2025-11-12 COD  Authored artifact fetcher.
  ------------------------------------------------------------
  SSE Principles Observed:
    - Stream-to-file; payloads are never buffered whole
    - All-or-nothing staging with scratch hygiene
============================================================*/

use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use zip::ZipArchive;

use crate::config::SynTillConfig;
use crate::error::{Result, SynTillError};
use crate::logger::Logger;
use crate::version::{ArtifactSource, UpdateDescriptor};

const EXTRACT_DIR: &str = "extracted";
const SNAPSHOT_ARCHIVE: &str = "snapshot.zip";
const RELEASE_ARCHIVE: &str = "release.zip";

/// Extracted new tree sitting in scratch storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedArtifact {
    /// Scratch directory owning everything below.
    pub scratch_dir: PathBuf,
    /// True root of the new tree (wrapper directory already unwrapped).
    pub extracted_path: PathBuf,
    /// Where the archive was downloaded; removed once extraction succeeds.
    pub archive_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ArchiveLayout {
    /// One generated top-level directory wraps the tree.
    Wrapped,
    /// Archive root is the tree root.
    Flat,
}

pub struct ArtifactFetcher {
    client: reqwest::Client,
    scratch_dir: PathBuf,
    token: Option<String>,
}

impl ArtifactFetcher {
    pub fn new(config: &SynTillConfig) -> Result<Self> {
        // No total timeout: archives may be large. Connect stays bounded.
        let client = reqwest::Client::builder()
            .connect_timeout(config.remote.timeout())
            .tcp_keepalive(Duration::from_secs(30))
            .user_agent(config.remote.user_agent.clone())
            .build()
            .map_err(|err| SynTillError::Network(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self {
            client,
            scratch_dir: config.scratch_dir(),
            token: config.remote.token.clone(),
        })
    }

    pub fn scratch_dir(&self) -> &Path {
        &self.scratch_dir
    }

    /// Download and extract the artifact named by `descriptor`.
    pub async fn fetch(
        &self,
        descriptor: &UpdateDescriptor,
        logger: &Logger,
    ) -> Result<StagedArtifact> {
        let source = descriptor.source.as_ref().ok_or_else(|| {
            SynTillError::ArtifactIntegrity("Update descriptor carries no artifact source".into())
        })?;
        let (url, archive_name, layout) = match source {
            ArtifactSource::Snapshot { url } => {
                (url.as_str(), SNAPSHOT_ARCHIVE.to_string(), ArchiveLayout::Wrapped)
            }
            ArtifactSource::Release { download_url } => (
                download_url.as_str(),
                archive_file_name(descriptor.asset_name.as_deref()),
                ArchiveLayout::Flat,
            ),
        };

        reset_dir(&self.scratch_dir).await?;
        let staged = self.stage(url, &archive_name, layout, logger).await;
        if let Err(err) = &staged {
            logger.warn("FETCH", format!("Staging failed, clearing scratch: {err}"));
            if let Err(cleanup) = tokio::fs::remove_dir_all(&self.scratch_dir).await {
                if cleanup.kind() != io::ErrorKind::NotFound {
                    logger.error(
                        "FETCH",
                        format!(
                            "Failed to remove scratch {}: {cleanup}",
                            self.scratch_dir.display()
                        ),
                    );
                }
            }
        }
        staged
    }

    async fn stage(
        &self,
        url: &str,
        archive_name: &str,
        layout: ArchiveLayout,
        logger: &Logger,
    ) -> Result<StagedArtifact> {
        let archive_path = self.scratch_dir.join(archive_name);
        let bytes = self.download(url, &archive_path).await?;
        logger.info(
            "FETCH",
            format!("Downloaded {bytes} bytes to {}", archive_path.display()),
        );

        let extract_root = self.scratch_dir.join(EXTRACT_DIR);
        let archive = archive_path.clone();
        let extracted_path = tokio::task::spawn_blocking(move || {
            extract_zip(&archive, &extract_root)?;
            match layout {
                ArchiveLayout::Wrapped => single_wrapper_dir(&extract_root),
                ArchiveLayout::Flat => Ok(extract_root),
            }
        })
        .await
        .map_err(|err| SynTillError::Runtime(format!("Extraction task failed: {err}")))??;

        tokio::fs::remove_file(&archive_path).await.map_err(|err| {
            SynTillError::Filesystem(format!(
                "Failed to remove archive {}: {err}",
                archive_path.display()
            ))
        })?;
        logger.info(
            "FETCH",
            format!("Staged tree at {}", extracted_path.display()),
        );

        Ok(StagedArtifact {
            scratch_dir: self.scratch_dir.clone(),
            extracted_path,
            archive_path,
        })
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let mut response = request
            .send()
            .await
            .map_err(|err| SynTillError::Network(format!("Download {url} failed: {err}")))?;
        if !response.status().is_success() {
            return Err(SynTillError::Network(format!(
                "Download {url} returned status {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dest).await.map_err(|err| {
            SynTillError::Filesystem(format!("Failed to create {}: {err}", dest.display()))
        })?;
        let mut written = 0u64;
        while let Some(chunk) = response
            .chunk()
            .await
            .map_err(|err| SynTillError::Network(format!("Download {url} interrupted: {err}")))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }
}

fn archive_file_name(asset_name: Option<&str>) -> String {
    asset_name
        .and_then(|name| Path::new(name).file_name())
        .map(|name| name.to_string_lossy().into_owned())
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| RELEASE_ARCHIVE.to_string())
}

async fn reset_dir(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => {
            return Err(SynTillError::Filesystem(format!(
                "Failed to clear scratch {}: {err}",
                dir.display()
            )))
        }
    }
    tokio::fs::create_dir_all(dir).await.map_err(|err| {
        SynTillError::Filesystem(format!("Failed to create scratch {}: {err}", dir.display()))
    })
}

/// Extract every entry of `archive_path` under `dest`, overwriting on conflict.
fn extract_zip(archive_path: &Path, dest: &Path) -> Result<()> {
    let integrity = |err: zip::result::ZipError| {
        SynTillError::ArtifactIntegrity(format!(
            "Unreadable archive {}: {err}",
            archive_path.display()
        ))
    };
    let file = File::open(archive_path)?;
    let mut archive = ZipArchive::new(file).map_err(integrity)?;
    fs::create_dir_all(dest)?;

    for index in 0..archive.len() {
        let mut entry = archive.by_index(index).map_err(integrity)?;
        let relative = entry.enclosed_name().map(|p| p.to_path_buf()).ok_or_else(|| {
            SynTillError::ArtifactIntegrity(format!(
                "Archive entry `{}` escapes the extraction root",
                entry.name()
            ))
        })?;
        let target = dest.join(relative);

        if entry.is_dir() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut out = File::create(&target)?;
        io::copy(&mut entry, &mut out).map_err(|err| {
            SynTillError::ArtifactIntegrity(format!(
                "Corrupt archive entry `{}`: {err}",
                entry.name()
            ))
        })?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&target, fs::Permissions::from_mode(mode & 0o777))?;
        }
    }
    Ok(())
}

/// Source snapshots wrap the tree in one generated `owner-repo-hash` folder.
fn single_wrapper_dir(root: &Path) -> Result<PathBuf> {
    let entries = fs::read_dir(root)?.collect::<io::Result<Vec<_>>>()?;
    match entries.as_slice() {
        [only] if only.file_type()?.is_dir() => Ok(only.path()),
        _ => Err(SynTillError::ArtifactIntegrity(format!(
            "Expected a single wrapper directory in snapshot archive, found {} top-level entries",
            entries.len()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{installation, snapshot_tree, zip_bytes};
    use httpmock::prelude::*;

    fn fetcher_for(root: &Path) -> ArtifactFetcher {
        let raw = format!("[install]\nroot = \"{}\"\n", root.display());
        ArtifactFetcher::new(&SynTillConfig::from_toml_str(&raw).expect("config")).expect("fetcher")
    }

    fn snapshot_descriptor(url: String) -> UpdateDescriptor {
        UpdateDescriptor {
            has_update: true,
            source: Some(ArtifactSource::Snapshot { url }),
            ..UpdateDescriptor::default()
        }
    }

    #[tokio::test]
    async fn snapshot_is_unwrapped_and_archive_removed() {
        let server = MockServer::start();
        let install = tempfile::tempdir().expect("tempdir");
        let archive = zip_bytes(&[
            ("synavera-till-4f2c9e1/", ""),
            ("synavera-till-4f2c9e1/manifest.json", "{\"version\":\"1.5.0\"}"),
            ("synavera-till-4f2c9e1/server/app.js", "// new server\n"),
        ]);
        let download = server.mock(|when, then| {
            when.method(GET).path("/snapshot.zip");
            then.status(200).body(archive.clone());
        });
        let fetcher = fetcher_for(install.path());

        let staged = fetcher
            .fetch(&snapshot_descriptor(server.url("/snapshot.zip")), &Logger::silent())
            .await
            .expect("fetch");

        download.assert();
        assert!(staged.extracted_path.ends_with("extracted/synavera-till-4f2c9e1"));
        assert!(staged.extracted_path.join("server/app.js").is_file());
        assert!(!staged.archive_path.exists());
        assert_eq!(staged.scratch_dir, fetcher.scratch_dir());
    }

    #[tokio::test]
    async fn release_asset_extracts_flat() {
        let server = MockServer::start();
        let install = tempfile::tempdir().expect("tempdir");
        let archive = zip_bytes(&[("manifest.json", "{\"version\":\"2.0.0\"}"), ("bin/run.sh", "echo")]);
        server.mock(|when, then| {
            when.method(GET).path("/assets/till-2.0.0.zip");
            then.status(200).body(archive.clone());
        });
        let descriptor = UpdateDescriptor {
            has_update: true,
            asset_name: Some("till-2.0.0.zip".into()),
            source: Some(ArtifactSource::Release {
                download_url: server.url("/assets/till-2.0.0.zip"),
            }),
            ..UpdateDescriptor::default()
        };

        let staged = fetcher_for(install.path())
            .fetch(&descriptor, &Logger::silent())
            .await
            .expect("fetch");
        assert!(staged.extracted_path.ends_with(EXTRACT_DIR));
        assert!(staged.extracted_path.join("bin/run.sh").is_file());
        assert!(staged.archive_path.ends_with("till-2.0.0.zip"));
    }

    #[tokio::test]
    async fn corrupt_archive_leaves_install_untouched() {
        let server = MockServer::start();
        let install = tempfile::tempdir().expect("tempdir");
        installation(install.path(), "1.4.0");
        let before = snapshot_tree(install.path());
        server.mock(|when, then| {
            when.method(GET).path("/snapshot.zip");
            then.status(200).body("this is not a zip archive");
        });
        let fetcher = fetcher_for(install.path());

        let err = fetcher
            .fetch(&snapshot_descriptor(server.url("/snapshot.zip")), &Logger::silent())
            .await
            .expect_err("corrupt");

        assert!(matches!(err, SynTillError::ArtifactIntegrity(_)));
        assert!(!fetcher.scratch_dir().exists());
        assert_eq!(snapshot_tree(install.path()), before);
    }

    #[tokio::test]
    async fn snapshot_without_single_wrapper_is_rejected() {
        let server = MockServer::start();
        let install = tempfile::tempdir().expect("tempdir");
        let archive = zip_bytes(&[("manifest.json", "{}"), ("server/app.js", "")]);
        server.mock(|when, then| {
            when.method(GET).path("/snapshot.zip");
            then.status(200).body(archive.clone());
        });
        let fetcher = fetcher_for(install.path());

        let err = fetcher
            .fetch(&snapshot_descriptor(server.url("/snapshot.zip")), &Logger::silent())
            .await
            .expect_err("no wrapper");
        assert!(err.to_string().contains("single wrapper directory"));
        assert!(!fetcher.scratch_dir().exists());
    }

    #[tokio::test]
    async fn http_failure_is_network_error() {
        let server = MockServer::start();
        let install = tempfile::tempdir().expect("tempdir");
        server.mock(|when, then| {
            when.method(GET).path("/snapshot.zip");
            then.status(404);
        });
        let fetcher = fetcher_for(install.path());

        let err = fetcher
            .fetch(&snapshot_descriptor(server.url("/snapshot.zip")), &Logger::silent())
            .await
            .expect_err("404");
        assert!(matches!(err, SynTillError::Network(_)));
        assert!(!fetcher.scratch_dir().exists());
    }

    #[tokio::test]
    async fn descriptor_without_source_fails_before_touching_scratch() {
        let install = tempfile::tempdir().expect("tempdir");
        let fetcher = fetcher_for(install.path());
        let err = fetcher
            .fetch(&UpdateDescriptor::default(), &Logger::silent())
            .await
            .expect_err("no source");
        assert!(matches!(err, SynTillError::ArtifactIntegrity(_)));
        assert!(!fetcher.scratch_dir().exists());
    }

    #[test]
    fn asset_names_are_reduced_to_file_names() {
        assert_eq!(archive_file_name(Some("../../etc/till.zip")), "till.zip");
        assert_eq!(archive_file_name(None), RELEASE_ARCHIVE);
    }
}

//! Client for the remote app-package repository

use std::io::Cursor;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use super::AppInfo;
use crate::error::{GalileoError, Result};

#[derive(Debug, Deserialize)]
struct RemoteApp {
    name: String,
}

/// Talks to the app repository's HTTP API: listing apps and downloading
/// their zip archives.
pub struct RepositoryClient {
    base_url: String,
    client: reqwest::Client,
}

impl RepositoryClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub async fn list(&self) -> Result<Vec<AppInfo>> {
        let url = format!("{}/api/apps", self.base_url);
        let apps: Vec<RemoteApp> = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GalileoError::Transport(e.to_string()))?
            .json()
            .await
            .map_err(|e| GalileoError::Transport(e.to_string()))?;

        Ok(apps
            .into_iter()
            .map(|app| AppInfo {
                name: app.name,
                manifest: serde_yaml::Mapping::new(),
            })
            .collect())
    }

    pub async fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.list().await?.iter().any(|app| app.name == name))
    }

    /// Downloads the app's zip archive and extracts it into
    /// `{target_dir}/{name}/`.
    pub async fn download(&self, name: &str, target_dir: &Path) -> Result<()> {
        let url = format!("{}/api/apps/{}/download", self.base_url, name);
        debug!(name, url, "downloading app archive");

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| GalileoError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(GalileoError::NotFound(format!(
                "repository has no app '{name}' ({})",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| GalileoError::Transport(e.to_string()))?;

        let target = target_dir.join(name);
        let archive_bytes = bytes.to_vec();
        let target_clone = target.clone();
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut archive = zip::ZipArchive::new(Cursor::new(archive_bytes))
                .map_err(|e| GalileoError::InvalidArgument(format!("bad app archive: {e}")))?;
            std::fs::create_dir_all(&target_clone)?;
            archive
                .extract(&target_clone)
                .map_err(|e| GalileoError::InvalidArgument(format!("bad app archive: {e}")))?;
            Ok(())
        })
        .await
        .map_err(|e| GalileoError::Fatal(format!("archive extraction task failed: {e}")))??;

        info!(name, target = %target.display(), "app extracted");
        Ok(())
    }
}

//! App loaders: local directory scan with remote repository fallback

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use serde_yaml::Mapping;
use tracing::{debug, warn};

use super::repository::RepositoryClient;
use super::{AppClient, AppContext, AppInfo, PluginRegistry};
use crate::error::{GalileoError, Result};

const MANIFEST_FILE: &str = "manifest.yml";

/// Resolves app names to instantiated [`AppClient`]s.
#[async_trait]
pub trait AppLoader: Send + Sync {
    async fn list(&self) -> Result<Vec<AppInfo>>;

    async fn load(&self, name: &str, parameters: HashMap<String, Value>) -> Result<AppClient>;
}

/// Loads apps from subdirectories of a root directory.
///
/// Each app directory holds a `manifest.yml` with at least a `name`; the
/// manifest's `generator` field (default `http`) names the registered
/// factory to instantiate.
pub struct DirectoryLoader {
    root: PathBuf,
    registry: Arc<PluginRegistry>,
}

impl DirectoryLoader {
    pub fn new(root: impl Into<PathBuf>, registry: Arc<PluginRegistry>) -> Self {
        Self {
            root: root.into(),
            registry,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn read_manifest(path: &Path) -> Result<Mapping> {
        let raw = std::fs::read_to_string(path)?;
        let manifest: Mapping = serde_yaml::from_str(&raw)?;
        if manifest.get("name").is_none() {
            return Err(GalileoError::InvalidArgument(format!(
                "manifest {} specifies no app name",
                path.display()
            )));
        }
        Ok(manifest)
    }

    fn require_manifest(&self, name: &str) -> Result<Mapping> {
        let path = self.root.join(name).join(MANIFEST_FILE);
        if !path.exists() {
            return Err(GalileoError::NotFound(format!(
                "no {} found in {}",
                MANIFEST_FILE,
                path.display()
            )));
        }
        Self::read_manifest(&path)
    }
}

#[async_trait]
impl AppLoader for DirectoryLoader {
    async fn list(&self) -> Result<Vec<AppInfo>> {
        let mut apps = Vec::new();

        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(_) => return Ok(apps),
        };

        for entry in entries.flatten() {
            let manifest_path = entry.path().join(MANIFEST_FILE);
            if !manifest_path.exists() {
                continue;
            }
            match Self::read_manifest(&manifest_path) {
                Ok(manifest) => {
                    let name = manifest
                        .get("name")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default()
                        .to_string();
                    apps.push(AppInfo { name, manifest });
                }
                Err(e) => {
                    debug!(path = %manifest_path.display(), error = %e, "skipping invalid manifest");
                }
            }
        }

        Ok(apps)
    }

    async fn load(&self, name: &str, parameters: HashMap<String, Value>) -> Result<AppClient> {
        let manifest = self.require_manifest(name)?;

        let generator = manifest
            .get("generator")
            .and_then(|v| v.as_str())
            .unwrap_or("http")
            .to_string();

        let context = AppContext {
            path: Some(self.root.join(name)),
            name: name.to_string(),
            manifest,
            parameters,
        };

        let plugin = self.registry.instantiate(&generator, &context)?;
        Ok(AppClient::new(name, context, plugin))
    }
}

/// Tries the local directory first, then downloads the app from the remote
/// repository, extracts it, and retries the local load.
pub struct RepositoryFallbackLoader {
    loader: DirectoryLoader,
    repository: RepositoryClient,
}

impl RepositoryFallbackLoader {
    pub fn new(loader: DirectoryLoader, repository: RepositoryClient) -> Self {
        Self { loader, repository }
    }
}

#[async_trait]
impl AppLoader for RepositoryFallbackLoader {
    async fn list(&self) -> Result<Vec<AppInfo>> {
        let mut by_name: HashMap<String, AppInfo> = HashMap::new();

        match self.repository.list().await {
            Ok(remote) => {
                for info in remote {
                    by_name.insert(info.name.clone(), info);
                }
            }
            Err(e) => {
                debug!(error = %e, "error getting list from app repository");
            }
        }

        // Local apps take priority over repository entries
        for info in self.loader.list().await? {
            by_name.insert(info.name.clone(), info);
        }

        Ok(by_name.into_values().collect())
    }

    async fn load(&self, name: &str, parameters: HashMap<String, Value>) -> Result<AppClient> {
        debug!(name, root = %self.loader.root().display(), "trying to load app from filesystem");
        match self.loader.load(name, parameters.clone()).await {
            Ok(app) => return Ok(app),
            Err(GalileoError::NotFound(_)) => {
                debug!(name, "app not found locally, trying to download");
            }
            Err(e) => return Err(e),
        }

        if self.repository.exists(name).await? {
            self.repository.download(name, self.loader.root()).await?;
            let app = self.loader.load(name, parameters).await?;
            debug!(name, "successfully loaded app from repository");
            Ok(app)
        } else {
            warn!(name, "app found neither locally nor in the repository");
            Err(GalileoError::NotFound(format!(
                "no app with name '{name}' found"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_app(root: &Path, name: &str, manifest: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join(MANIFEST_FILE), manifest).unwrap();
    }

    fn loader(root: &Path) -> DirectoryLoader {
        DirectoryLoader::new(root, Arc::new(PluginRegistry::with_builtins()))
    }

    #[tokio::test]
    async fn list_finds_apps_with_valid_manifests() {
        let dir = tempfile::tempdir().unwrap();
        write_app(dir.path(), "alpha", "name: alpha\n");
        write_app(dir.path(), "broken", "version: 1\n");
        std::fs::create_dir_all(dir.path().join("no-manifest")).unwrap();

        let apps = loader(dir.path()).list().await.unwrap();
        assert_eq!(apps.len(), 1);
        assert_eq!(apps[0].name, "alpha");
    }

    #[tokio::test]
    async fn load_instantiates_default_http_generator() {
        let dir = tempfile::tempdir().unwrap();
        write_app(dir.path(), "alpha", "name: alpha\n");

        let mut app = loader(dir.path())
            .load("alpha", HashMap::new())
            .await
            .unwrap();
        let request = app.next_request();
        assert_eq!(request.method, "get");
        assert_eq!(app.context.path, Some(dir.path().join("alpha")));
    }

    #[tokio::test]
    async fn load_missing_app_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let result = loader(dir.path()).load("ghost", HashMap::new()).await;
        assert!(matches!(result, Err(GalileoError::NotFound(_))));
    }

    #[tokio::test]
    async fn load_unknown_generator_fails() {
        let dir = tempfile::tempdir().unwrap();
        write_app(dir.path(), "alpha", "name: alpha\ngenerator: custom\n");

        let result = loader(dir.path()).load("alpha", HashMap::new()).await;
        assert!(matches!(result, Err(GalileoError::NotFound(_))));
    }
}

//! Client apps
//!
//! An app is a pluggable request builder identified by name. The original
//! system hot-loaded generator scripts from disk; here apps are explicit
//! plugins: a manifest's `generator` field names a factory in the
//! [`PluginRegistry`], and the loader instantiates it with the manifest
//! context. The built-in `http` app issues one configurable request per call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;
use serde_yaml::Mapping;

use crate::error::{GalileoError, Result};
use crate::routing::RequestKwargs;

mod loader;
mod repository;

pub use loader::{AppLoader, DirectoryLoader, RepositoryFallbackLoader};
pub use repository::RepositoryClient;

/// One abstract request produced by an app.
#[derive(Debug, Clone, PartialEq)]
pub struct AppRequest {
    pub method: String,
    pub endpoint: String,
    pub kwargs: RequestKwargs,
}

/// What a loaded app gets to know about itself.
#[derive(Debug, Clone, Default)]
pub struct AppContext {
    /// Directory the app was loaded from; absent for built-ins.
    pub path: Option<PathBuf>,
    pub name: String,
    pub manifest: Mapping,
    pub parameters: HashMap<String, Value>,
}

/// Metadata of an installed or downloadable app.
#[derive(Debug, Clone)]
pub struct AppInfo {
    pub name: String,
    pub manifest: Mapping,
}

/// The request-producing side of an app.
pub trait AppPlugin: Send {
    fn next_request(&mut self) -> AppRequest;
}

/// A named, instantiated app ready to produce requests.
pub struct AppClient {
    pub name: String,
    pub context: AppContext,
    plugin: Box<dyn AppPlugin>,
}

impl AppClient {
    pub fn new(name: impl Into<String>, context: AppContext, plugin: Box<dyn AppPlugin>) -> Self {
        Self {
            name: name.into(),
            context,
            plugin,
        }
    }

    /// The default app used when a client config names no app: one request
    /// per call built from the `method`/`path`/`kwargs` parameters.
    pub fn http(parameters: HashMap<String, Value>) -> Self {
        let context = AppContext {
            path: None,
            name: "http".to_string(),
            manifest: Mapping::new(),
            parameters: parameters.clone(),
        };
        Self::new("http", context, Box::new(HttpApp::new(&parameters)))
    }

    pub fn next_request(&mut self) -> AppRequest {
        self.plugin.next_request()
    }
}

type PluginFactory = dyn Fn(&AppContext) -> Result<Box<dyn AppPlugin>> + Send + Sync;

/// Registry of plugin factories, keyed by the manifest's `generator` name.
///
/// Populated at startup; the directory scan only decides *which* registered
/// factory an app directory instantiates.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    factories: HashMap<String, Arc<PluginFactory>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in `http` generator.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("http", |context| {
            Ok(Box::new(HttpApp::new(&context.parameters)) as Box<dyn AppPlugin>)
        });
        registry
    }

    pub fn register<F>(&mut self, name: impl Into<String>, factory: F)
    where
        F: Fn(&AppContext) -> Result<Box<dyn AppPlugin>> + Send + Sync + 'static,
    {
        self.factories.insert(name.into(), Arc::new(factory));
    }

    pub fn instantiate(&self, generator: &str, context: &AppContext) -> Result<Box<dyn AppPlugin>> {
        let factory = self.factories.get(generator).ok_or_else(|| {
            GalileoError::NotFound(format!("no registered app generator '{generator}'"))
        })?;
        factory(context)
    }
}

/// Built-in app producing the same request on every call.
pub struct HttpApp {
    method: String,
    path: String,
    kwargs: RequestKwargs,
}

impl HttpApp {
    pub fn new(parameters: &HashMap<String, Value>) -> Self {
        let method = parameters
            .get("method")
            .and_then(Value::as_str)
            .unwrap_or("get")
            .to_string();
        let path = parameters
            .get("path")
            .and_then(Value::as_str)
            .unwrap_or("/")
            .to_string();
        let kwargs = parameters
            .get("kwargs")
            .cloned()
            .and_then(|value| serde_json::from_value(value).ok())
            .unwrap_or_default();

        Self {
            method,
            path,
            kwargs,
        }
    }
}

impl AppPlugin for HttpApp {
    fn next_request(&mut self) -> AppRequest {
        AppRequest {
            method: self.method.clone(),
            endpoint: self.path.clone(),
            kwargs: self.kwargs.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn http_app_defaults_to_get_root() {
        let mut app = AppClient::http(HashMap::new());
        let request = app.next_request();
        assert_eq!(request.method, "get");
        assert_eq!(request.endpoint, "/");
        assert_eq!(request.kwargs, RequestKwargs::default());
    }

    #[test]
    fn http_app_honors_parameters() {
        let mut parameters = HashMap::new();
        parameters.insert("method".to_string(), json!("post"));
        parameters.insert("path".to_string(), json!("/api/predict"));
        parameters.insert("kwargs".to_string(), json!({"json": {"k": 1}}));

        let mut app = AppClient::http(parameters);
        let request = app.next_request();

        assert_eq!(request.method, "post");
        assert_eq!(request.endpoint, "/api/predict");
        assert_eq!(request.kwargs.json, Some(json!({"k": 1})));
    }

    #[test]
    fn registry_instantiates_registered_factory() {
        let registry = PluginRegistry::with_builtins();
        let context = AppContext {
            name: "x".to_string(),
            ..Default::default()
        };
        assert!(registry.instantiate("http", &context).is_ok());
        assert!(matches!(
            registry.instantiate("nope", &context),
            Err(GalileoError::NotFound(_))
        ));
    }
}

use crate::backend::Backend;
use crate::backend::git::GitBackend;
use crate::config::{Encoding, Identity, VellumConfig};
use crate::errors::{BackendError, BackendId, BackendResult};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

pub const GIT_FLAVOR: &str = "git";

/// Settings every backend is created with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendSettings {
    pub identity: Identity,
    pub default_branch: String,
    pub default_encoding: Encoding,
}

impl Default for BackendSettings {
    fn default() -> Self {
        BackendSettings::from(&VellumConfig::default())
    }
}

impl From<&VellumConfig> for BackendSettings {
    fn from(config: &VellumConfig) -> Self {
        BackendSettings {
            identity: config.identity.clone(),
            default_branch: config.repository.default_branch.clone(),
            default_encoding: config.repository.default_encoding,
        }
    }
}

pub type BackendFactory =
    Arc<dyn Fn(BackendId, &BackendSettings) -> BackendResult<Box<dyn Backend>> + Send + Sync>;

/// Flavor tag to backend factory, filled in at startup.
#[derive(Clone)]
pub struct Registry {
    settings: BackendSettings,
    factories: BTreeMap<String, BackendFactory>,
}

impl Registry {
    /// A registry with no flavors at all.
    pub fn new(settings: BackendSettings) -> Self {
        Registry {
            settings,
            factories: BTreeMap::new(),
        }
    }

    /// A registry knowing the built-in `git` flavor.
    pub fn with_defaults(settings: BackendSettings) -> Self {
        let mut registry = Registry::new(settings);
        registry.register(GIT_FLAVOR, |id, settings| {
            Ok(Box::new(GitBackend::open(id, settings)?) as Box<dyn Backend>)
        });
        registry
    }

    pub fn register<F>(&mut self, flavor: impl Into<String>, factory: F)
    where
        F: Fn(BackendId, &BackendSettings) -> BackendResult<Box<dyn Backend>> + Send + Sync + 'static,
    {
        self.factories.insert(flavor.into(), Arc::new(factory));
    }

    pub fn flavors(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }

    pub fn settings(&self) -> &BackendSettings {
        &self.settings
    }

    /// A fresh backend for `path`; nothing is shared with earlier instances.
    pub fn open(&self, flavor: &str, path: &Path) -> BackendResult<Box<dyn Backend>> {
        let factory = self
            .factories
            .get(flavor)
            .ok_or_else(|| BackendError::UnknownFlavor(flavor.to_string()))?;

        factory(BackendId::new(flavor.to_string(), path.to_path_buf()), &self.settings)
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("settings", &self.settings)
            .field("flavors", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

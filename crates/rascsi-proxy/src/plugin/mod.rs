//! Lifecycle plugins.
//!
//! Plugins observe device lifecycle changes passing through the proxy.
//! `attach` and `insert` hooks run before the command reaches the engine;
//! `detach` and `eject` hooks run after the engine has answered. A failing
//! hook is logged and never stops the command.

pub mod automount;
pub mod exec;

use std::fmt;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info, warn};

use rascsi_core::{Error, Result};

pub use automount::{AutomountConfig, AutomountPlugin};
pub use exec::{ExecConfig, ExecPlugin};

/// Suffix of plugin manifests in the plugin directory.
pub const MANIFEST_SUFFIX: &str = "toml";

/// Lifecycle point a plugin is notified about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Hook {
    Attach,
    Insert,
    Detach,
    Eject,
}

impl Hook {
    pub fn as_str(&self) -> &'static str {
        match self {
            Hook::Attach => "attach",
            Hook::Insert => "insert",
            Hook::Detach => "detach",
            Hook::Eject => "eject",
        }
    }
}

impl fmt::Display for Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Device a hook is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub id: u32,
    pub unit: u32,
    /// Four-letter type tag such as `SCHD`.
    pub device_type: String,
    /// Absolute image path.
    pub path: PathBuf,
}

/// A lifecycle observer.
///
/// Every hook defaults to doing nothing, so plugins implement only the
/// points they care about.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn name(&self) -> &str;

    /// Runs once at startup, before any command is served.
    async fn init_hook(&self) -> Result<()> {
        Ok(())
    }

    async fn attach_hook(&self, _event: &DeviceEvent) -> Result<()> {
        Ok(())
    }

    async fn insert_hook(&self, _event: &DeviceEvent) -> Result<()> {
        Ok(())
    }

    async fn detach_hook(&self, _event: &DeviceEvent) -> Result<()> {
        Ok(())
    }

    async fn eject_hook(&self, _event: &DeviceEvent) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Plugins in registration order.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: Vec<Box<dyn Plugin>>,
}

impl fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin: Box<dyn Plugin>) {
        info!(plugin = plugin.name(), "Registered plugin");
        self.plugins.push(plugin);
    }

    pub fn with_plugin(mut self, plugin: impl Plugin + 'static) -> Self {
        self.register(Box::new(plugin));
        self
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.plugins.iter().map(|p| p.name()).collect()
    }

    /// Load every manifest in `dir`, in file-name order.
    ///
    /// A missing directory yields an empty registry. Manifests that cannot be
    /// read or parsed are logged and skipped.
    pub async fn discover(dir: &Path) -> Self {
        let mut registry = Self::new();
        let manifests = match manifest_paths(dir).await {
            Ok(paths) => paths,
            Err(e) => {
                warn!(dir = %dir.display(), error = %e, "Could not scan plugin directory");
                return registry;
            }
        };

        for path in manifests {
            match PluginManifest::load(&path).await {
                Ok(manifest) => {
                    let fallback = path
                        .file_stem()
                        .map(|s| s.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    registry.register(manifest.into_plugin(&fallback));
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping plugin manifest"),
            }
        }
        registry
    }

    /// Run every plugin's init hook.
    pub async fn init_all(&self) {
        for plugin in &self.plugins {
            if let Err(e) = plugin.init_hook().await {
                warn!(plugin = plugin.name(), error = %e, "Plugin init failed");
            }
        }
    }

    /// Notify every plugin about every event, devices first, then plugins.
    pub async fn dispatch(&self, hook: Hook, events: &[DeviceEvent]) {
        for event in events {
            for plugin in &self.plugins {
                debug!(
                    plugin = plugin.name(),
                    hook = hook.as_str(),
                    id = event.id,
                    unit = event.unit,
                    device_type = %event.device_type,
                    path = %event.path.display(),
                    "Running hook"
                );
                let result = match hook {
                    Hook::Attach => plugin.attach_hook(event).await,
                    Hook::Insert => plugin.insert_hook(event).await,
                    Hook::Detach => plugin.detach_hook(event).await,
                    Hook::Eject => plugin.eject_hook(event).await,
                };
                if let Err(e) = result {
                    warn!(plugin = plugin.name(), hook = hook.as_str(), id = event.id, error = %e, "Hook failed");
                }
            }
        }
    }
}

async fn manifest_paths(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut paths = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_manifest = path
            .extension()
            .is_some_and(|ext| ext == MANIFEST_SUFFIX);
        if is_manifest && entry.file_type().await?.is_file() {
            paths.push(path);
        }
    }
    paths.sort();
    Ok(paths)
}

// =============================================================================
// Manifests
// =============================================================================

/// One plugin manifest, selected by its `kind` key.
///
/// ```toml
/// kind = "exec"
/// name = "notify"
/// program = "/usr/local/bin/rascsi-hook"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PluginManifest {
    Automount(AutomountConfig),
    Exec(ExecConfig),
}

impl PluginManifest {
    pub fn parse(text: &str) -> Result<Self> {
        toml::from_str(text).map_err(|e| Error::invalid_argument(format!("invalid plugin manifest: {}", e)))
    }

    pub async fn load(path: &Path) -> Result<Self> {
        Self::parse(&tokio::fs::read_to_string(path).await?)
    }

    /// Build the plugin, naming it `fallback` when the manifest has no name.
    pub fn into_plugin(self, fallback: &str) -> Box<dyn Plugin> {
        match self {
            PluginManifest::Automount(config) => Box::new(AutomountPlugin::new(fallback, config)),
            PluginManifest::Exec(config) => Box::new(ExecPlugin::new(fallback, config)),
        }
    }
}

//! frontrank-plugin - reporter plugin ABI and registry
//!
//! A plugin pushes every new front ranking into an external trading system.
//! Plugins come in two kinds:
//!
//! - **Native**: loaded at runtime from a dynamic library over a C ABI
//! - **Static**: compiled into the binary and registered by name
//!
//! The process-wide registry enforces load-once per name. Unloading
//! releases the registry slot for both kinds; for static plugins a typed
//! warning reports that the code itself stays resident in the process.

mod error;
mod native;
mod registry;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;

pub use error::{Error, Result};
pub use native::native_lib_path;
pub use registry::{get, list, load, register_static, unregister, PluginInfo};

/// Capability set every reporter plugin provides.
///
/// `stop` must be idempotent; `join` blocks until in-flight work drains.
/// `report_fronts` must stay safe to call concurrently with `stop`.
pub trait FrontPlugin: Send + Sync {
    /// Initialize from a config file path.
    fn init(&self, cfg_path: &str) -> Result<()>;

    /// Push a new front ranking, best first.
    fn report_fronts(&self, fronts: &[String]) -> Result<()>;

    /// Trading seats routed through this plugin's connection.
    fn seats(&self) -> Vec<String> {
        Vec::new()
    }

    /// Plugin-defined ordering weight among sibling plugins.
    fn priority(&self) -> i32 {
        0
    }

    /// Begin shutdown; idempotent.
    fn stop(&self);

    /// Block until all in-flight work drained.
    fn join(&self) -> Result<()>;
}

/// Where a plugin's code comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginKind {
    Native,
    Static,
}

impl fmt::Display for PluginKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => f.write_str("native"),
            Self::Static => f.write_str("static"),
        }
    }
}

/// A registered plugin with its identity.
pub struct PluginContainer {
    name: String,
    kind: PluginKind,
    lib_path: Option<PathBuf>,
    plugin: Arc<dyn FrontPlugin>,
}

impl fmt::Debug for PluginContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PluginContainer")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("lib_path", &self.lib_path)
            .finish_non_exhaustive()
    }
}

impl PluginContainer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> PluginKind {
        self.kind
    }

    pub fn lib_path(&self) -> Option<&std::path::Path> {
        self.lib_path.as_deref()
    }

    pub fn plugin(&self) -> &dyn FrontPlugin {
        self.plugin.as_ref()
    }

    /// Shared handle to the plugin itself, for reporters that outlive the
    /// registry entry.
    pub fn plugin_arc(&self) -> Arc<dyn FrontPlugin> {
        Arc::clone(&self.plugin)
    }

    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            name: self.name.clone(),
            kind: self.kind,
            lib: self
                .lib_path
                .as_ref()
                .map(|p| p.display().to_string()),
        }
    }
}

impl fmt::Display for PluginContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Plugin{{Name:{} Kind:{} Lib:{:?}}}",
            self.name, self.kind, self.lib_path
        )
    }
}

//! Process-wide plugin registry with load-once semantics per name.

use std::path::Path;
use std::sync::{Arc, OnceLock};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::native::NativePlugin;
use crate::{FrontPlugin, PluginContainer, PluginKind};

static REGISTRY: OnceLock<DashMap<String, Arc<PluginContainer>>> = OnceLock::new();

fn registry() -> &'static DashMap<String, Arc<PluginContainer>> {
    REGISTRY.get_or_init(DashMap::new)
}

/// Registry view of one plugin, as reported on the control plane.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PluginInfo {
    pub name: String,
    pub kind: PluginKind,
    pub lib: Option<String>,
}

/// Load a native plugin from `lib_dir` and register it under `name`.
pub fn load(lib_dir: &Path, name: &str) -> Result<Arc<PluginContainer>> {
    match registry().entry(name.to_string()) {
        Entry::Occupied(_) => Err(Error::AlreadyLoaded(name.to_string())),
        Entry::Vacant(slot) => {
            let native = NativePlugin::load(lib_dir, name)?;
            let container = Arc::new(PluginContainer {
                name: name.to_string(),
                kind: PluginKind::Native,
                lib_path: Some(native.path().to_path_buf()),
                plugin: Arc::new(native),
            });

            slot.insert(Arc::clone(&container));
            info!(plugin = %container, "plugin registered");

            Ok(container)
        }
    }
}

/// Register a compiled-in plugin under `name`.
pub fn register_static(name: &str, plugin: Arc<dyn FrontPlugin>) -> Result<Arc<PluginContainer>> {
    match registry().entry(name.to_string()) {
        Entry::Occupied(_) => Err(Error::AlreadyLoaded(name.to_string())),
        Entry::Vacant(slot) => {
            let container = Arc::new(PluginContainer {
                name: name.to_string(),
                kind: PluginKind::Static,
                lib_path: None,
                plugin,
            });

            slot.insert(Arc::clone(&container));
            info!(plugin = %container, "static plugin registered");

            Ok(container)
        }
    }
}

/// Fetch a registered plugin.
pub fn get(name: &str) -> Option<Arc<PluginContainer>> {
    registry().get(name).map(|entry| Arc::clone(&entry))
}

/// Release the registry slot of `name` and hand the container back.
///
/// For static plugins the slot is released but the code stays part of the
/// process; that partial unload is reported as a warning alongside the
/// container.
pub fn unregister(name: &str) -> Result<(Arc<PluginContainer>, Option<Error>)> {
    let (_, container) = registry()
        .remove(name)
        .ok_or_else(|| Error::NotRegistered(name.to_string()))?;

    let warning = match container.kind() {
        PluginKind::Native => None,
        PluginKind::Static => {
            warn!(plugin = %container, "static plugin unloaded from registry only");
            Some(Error::StaticResident(name.to_string()))
        }
    };

    Ok((container, warning))
}

/// Registry contents, for the control-plane info command.
pub fn list() -> Vec<PluginInfo> {
    registry().iter().map(|entry| entry.info()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullPlugin;

    impl FrontPlugin for NullPlugin {
        fn init(&self, _cfg_path: &str) -> Result<()> {
            Ok(())
        }

        fn report_fronts(&self, _fronts: &[String]) -> Result<()> {
            Ok(())
        }

        fn stop(&self) {}

        fn join(&self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_static_register_load_once() {
        register_static("reg_once", Arc::new(NullPlugin)).unwrap();

        let err = register_static("reg_once", Arc::new(NullPlugin)).unwrap_err();
        assert!(matches!(err, Error::AlreadyLoaded(_)));

        let (_, warning) = unregister("reg_once").unwrap();
        assert!(matches!(warning, Some(Error::StaticResident(_))));
    }

    #[test]
    fn test_unregister_releases_slot() {
        register_static("reg_cycle", Arc::new(NullPlugin)).unwrap();
        unregister("reg_cycle").unwrap();

        assert!(get("reg_cycle").is_none());
        // the name is reusable after release
        register_static("reg_cycle", Arc::new(NullPlugin)).unwrap();
        unregister("reg_cycle").unwrap();
    }

    #[test]
    fn test_unregister_unknown_fails() {
        let err = unregister("reg_ghost").unwrap_err();
        assert!(matches!(err, Error::NotRegistered(_)));
    }

    #[test]
    fn test_load_missing_native_keeps_slot_free() {
        let err = load(Path::new("/nonexistent"), "reg_native").unwrap_err();
        assert!(matches!(err, Error::OpenLib(_)));
        assert!(get("reg_native").is_none());
    }
}

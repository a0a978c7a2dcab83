//! Plugin registry: name → initialized plugin.
//!
//! Plugins are expensive to initialize and shared by every reconciler in the
//! process, so the daemon uses one registry built lazily through
//! [`PluginRegistry::global`]. Reconcilers receive the registry explicitly,
//! which lets tests hand each reconciler a fresh [`PluginRegistry::new`].
//!
//! Entries are never removed or replaced once registered.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use tracing::info;

use crate::error::{PluginError, PluginResult};
use crate::plugin::ResourcePlugin;

/// Lock-guarded map from plugin name to plugin.
#[derive(Default)]
pub struct PluginRegistry {
    plugins: RwLock<HashMap<String, Arc<dyn ResourcePlugin>>>,
}

impl PluginRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, constructed on first use.
    pub fn global() -> Arc<PluginRegistry> {
        static GLOBAL: OnceLock<Arc<PluginRegistry>> = OnceLock::new();
        GLOBAL.get_or_init(|| Arc::new(PluginRegistry::new())).clone()
    }

    /// Initialize `plugin` and register it under `name`.
    ///
    /// Fails without calling `init` when the name is already taken. The
    /// write lock is held across `init` so two registrations of the same
    /// name cannot both initialize.
    pub fn register(&self, name: &str, plugin: Arc<dyn ResourcePlugin>) -> PluginResult<()> {
        let mut plugins = self.plugins.write().map_err(|_| PluginError::Poisoned)?;
        if plugins.contains_key(name) {
            return Err(PluginError::AlreadyRegistered(name.to_string()));
        }
        plugin.init()?;
        plugins.insert(name.to_string(), plugin);
        info!(plugin = %name, "resource plugin registered");
        Ok(())
    }

    /// Look up a plugin by name.
    pub fn get(&self, name: &str) -> PluginResult<Arc<dyn ResourcePlugin>> {
        let plugins = self.plugins.read().map_err(|_| PluginError::Poisoned)?;
        plugins
            .get(name)
            .cloned()
            .ok_or_else(|| PluginError::NotFound(name.to_string()))
    }

    /// Registered plugin names, sorted.
    pub fn names(&self) -> Vec<String> {
        let Ok(plugins) = self.plugins.read() else {
            return Vec::new();
        };
        let mut names: Vec<String> = plugins.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use stride_state::WorkloadRef;

    use crate::plugin::WorkloadStatus;

    #[derive(Default)]
    struct CountingPlugin {
        inits: AtomicU32,
        fail_init: bool,
    }

    impl ResourcePlugin for CountingPlugin {
        fn init(&self) -> PluginResult<()> {
            self.inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_init {
                return Err(PluginError::Call("no kubeconfig".to_string()));
            }
            Ok(())
        }
        fn get_status(&self, _: &WorkloadRef) -> PluginResult<WorkloadStatus> {
            Ok(WorkloadStatus::default())
        }
        fn set_weight(&self, _: &WorkloadRef, _: u32) -> PluginResult<()> {
            Ok(())
        }
        fn verify_weight(&self, _: &WorkloadRef, _: u32) -> PluginResult<bool> {
            Ok(true)
        }
        fn promote(&self, _: &WorkloadRef) -> PluginResult<()> {
            Ok(())
        }
        fn abort(&self, _: &WorkloadRef) -> PluginResult<()> {
            Ok(())
        }
        fn restart(&self, _: &WorkloadRef) -> PluginResult<()> {
            Ok(())
        }
    }

    #[test]
    fn register_initializes_once() {
        let registry = PluginRegistry::new();
        let plugin = Arc::new(CountingPlugin::default());
        registry.register("statefulset", plugin.clone()).unwrap();

        assert!(registry.get("statefulset").is_ok());
        assert_eq!(plugin.inits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_name_is_rejected_without_init() {
        let registry = PluginRegistry::new();
        registry
            .register("statefulset", Arc::new(CountingPlugin::default()))
            .unwrap();

        let second = Arc::new(CountingPlugin::default());
        let err = registry.register("statefulset", second.clone()).unwrap_err();
        assert!(matches!(err, PluginError::AlreadyRegistered(name) if name == "statefulset"));
        assert_eq!(second.inits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn failed_init_is_not_registered() {
        let registry = PluginRegistry::new();
        let plugin = Arc::new(CountingPlugin {
            fail_init: true,
            ..Default::default()
        });
        assert!(registry.register("broken", plugin).is_err());
        assert!(matches!(registry.get("broken"), Err(PluginError::NotFound(_))));
    }

    #[test]
    fn missing_plugin_not_found() {
        let registry = PluginRegistry::new();
        assert!(matches!(registry.get("nope"), Err(PluginError::NotFound(name)) if name == "nope"));
    }

    #[test]
    fn global_is_a_singleton() {
        let a = PluginRegistry::global();
        let b = PluginRegistry::global();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn names_are_sorted() {
        let registry = PluginRegistry::new();
        registry.register("b", Arc::new(CountingPlugin::default())).unwrap();
        registry.register("a", Arc::new(CountingPlugin::default())).unwrap();
        assert_eq!(registry.names(), vec!["a".to_string(), "b".to_string()]);
    }
}

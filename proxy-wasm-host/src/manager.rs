//! Registry of named wasm plugins
//!
//! One [`WasmManager`] is built at process start and shared by reference
//! with every path that needs plugin lookup. Lookups go straight to a
//! concurrent map; add, update, reload and uninstall of the same name are
//! serialized by a per-name lock so slow plugin builds of one name never
//! block another.

use crate::error::WasmError;
use crate::loader::PluginLoader;
use crate::wrapper::PluginWrapper;
use dashmap::DashMap;
use proxy_wasm_api::PluginConfig;
use std::sync::{Arc, Mutex, PoisonError};

/// Process-wide plugin registry
pub struct WasmManager {
    plugins: DashMap<String, Arc<PluginWrapper>>,
    name_locks: DashMap<String, Arc<Mutex<()>>>,
    loader: PluginLoader,
}

impl WasmManager {
    /// Create an empty registry that builds plugins with `loader`
    pub fn new(loader: PluginLoader) -> Self {
        Self {
            plugins: DashMap::new(),
            name_locks: DashMap::new(),
            loader,
        }
    }

    /// Create an empty registry with the default engines and file loading
    pub fn with_defaults() -> Result<Self, WasmError> {
        Ok(Self::new(PluginLoader::with_defaults()?))
    }

    pub fn loader(&self) -> &PluginLoader {
        &self.loader
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.name_locks
                .entry(name.to_string())
                .or_default()
                .value(),
        )
    }

    /// Drop the lock of a name that is not registered and not contended
    ///
    /// Must be called with `lock` held. The strong count is read under the
    /// map's shard lock, so a caller that already cloned the lock keeps it
    /// in the map.
    fn release_name_lock(&self, name: &str, lock: &Arc<Mutex<()>>) {
        if self.plugins.contains_key(name) {
            return;
        }
        self.name_locks
            .remove_if(name, |_, held| Arc::ptr_eq(held, lock) && Arc::strong_count(held) == 2);
    }

    /// Register a new plugin or update an existing one
    ///
    /// A config equal to the stored one is a no-op. If engine, path and
    /// url are unchanged the existing plugin is only resized; otherwise a
    /// new plugin is built and swapped in. On failure the registry keeps
    /// its previous state.
    pub fn add_or_update_wasm(&self, mut config: PluginConfig) -> Result<(), WasmError> {
        if config.plugin_name.is_empty() {
            tracing::error!("AddOrUpdateWasm empty plugin name");
            return Err(WasmError::EmptyPluginName);
        }
        // Stored configs always carry the resolved pool size
        config.instance_num = i32::try_from(config.resolved_instance_num()).unwrap_or(i32::MAX);

        let lock = self.name_lock(&config.plugin_name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(wrapper) = self.get_wasm_plugin_wrapper_by_name(&config.plugin_name) {
            return self.update_wasm(&wrapper, config);
        }

        let name = config.plugin_name.clone();
        let plugin = match self.loader.load(config) {
            Ok(plugin) => plugin,
            Err(e) => {
                tracing::error!(plugin = %name, error = %e, "Failed to create wasm plugin");
                self.release_name_lock(&name, &lock);
                return Err(e);
            }
        };
        let config = plugin.config().clone();

        self.plugins
            .insert(name.clone(), Arc::new(PluginWrapper::new(config, plugin)));
        tracing::info!(plugin = %name, "Added new wasm plugin");
        Ok(())
    }

    fn update_wasm(&self, wrapper: &PluginWrapper, config: PluginConfig) -> Result<(), WasmError> {
        let old_config = wrapper.config();
        if config == old_config {
            tracing::info!(plugin = %config.plugin_name, "Skipping update for same config");
            return Ok(());
        }

        let rebuild = match (&config.vm_config, &old_config.vm_config) {
            (Some(new_vm), Some(old_vm)) => new_vm.requires_rebuild(old_vm),
            _ => false,
        };

        let plugin = if rebuild {
            self.loader.load(config.clone()).inspect_err(|e| {
                tracing::error!(
                    plugin = %config.plugin_name,
                    error = %e,
                    "Failed to create wasm plugin for update"
                );
            })?
        } else {
            let plugin = wrapper.plugin();
            let wanted = usize::try_from(config.instance_num).unwrap_or(0);
            let actual = plugin.ensure_instance_num(wanted);
            if actual == 0 {
                tracing::error!(
                    plugin = %config.plugin_name,
                    wanted,
                    actual,
                    "Failed to update wasm instance num"
                );
                return Err(WasmError::InstanceCreate {
                    plugin: config.plugin_name.clone(),
                    wanted,
                });
            }
            plugin
        };

        if let Some(vm_config) = &config.vm_config {
            plugin.set_cpu_limit(vm_config.cpu);
            plugin.set_mem_limit(vm_config.mem);
        }

        tracing::info!(
            plugin = %config.plugin_name,
            rebuild,
            instances = plugin.instance_num(),
            "Updated wasm plugin"
        );
        wrapper.update(config, Some(plugin));
        Ok(())
    }

    /// Rebuild a plugin from its stored config
    ///
    /// Used when the module changed on disk while the config did not.
    pub fn reload_wasm(&self, name: &str) -> Result<(), WasmError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let Some(wrapper) = self.get_wasm_plugin_wrapper_by_name(name) else {
            self.release_name_lock(name, &lock);
            return Err(WasmError::PluginNotFound(name.to_string()));
        };

        let config = wrapper.config();
        let plugin = self.loader.load(config.clone()).inspect_err(|e| {
            tracing::error!(plugin = %name, error = %e, "Failed to reload wasm plugin");
        })?;

        wrapper.update(config, Some(plugin));
        tracing::info!(plugin = %name, "Reloaded wasm plugin");
        Ok(())
    }

    /// Look up the wrapper of a plugin
    pub fn get_wasm_plugin_wrapper_by_name(&self, name: &str) -> Option<Arc<PluginWrapper>> {
        if name.is_empty() {
            return None;
        }
        self.plugins.get(name).map(|entry| Arc::clone(entry.value()))
    }

    /// Remove a plugin and release its instances
    pub fn uninstall_wasm_plugin_by_name(&self, name: &str) -> Result<(), WasmError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);

        let removed = self.plugins.remove(name);
        self.release_name_lock(name, &lock);
        let Some((_, wrapper)) = removed else {
            tracing::error!(plugin = %name, "Uninstall: wasm plugin not found");
            return Err(WasmError::PluginNotFound(name.to_string()));
        };

        wrapper.plugin().clear();
        tracing::info!(plugin = %name, "Uninstalled wasm plugin");
        Ok(())
    }

    /// Names of all registered plugins
    pub fn plugin_names(&self) -> Vec<String> {
        self.plugins.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Number of registered plugins
    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

impl std::fmt::Debug for WasmManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmManager")
            .field("plugins", &self.plugin_names())
            .field("loader", &self.loader)
            .finish()
    }
}

//! Hot-swappable holder of a named plugin
//!
//! A [`PluginWrapper`] keeps the active plugin, its config and the
//! registered [`PluginHandler`]s. [`PluginWrapper::update`] publishes a
//! new config and, if given a different plugin, swaps it in:
//!
//! ```text
//! on_config_update(new config)    every handler
//! on_plugin_start(new plugin)     every handler, before the swap
//! ── publish new plugin ──
//! on_plugin_destroy(old plugin)   every handler, after the swap
//! old.clear()
//! ```
//!
//! Handlers run without the wrapper's lock held. Destroy is not a barrier:
//! calls already running on the old plugin may still be in flight.

use crate::plugin::WasmPlugin;
use proxy_wasm_api::PluginConfig;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Observer of a wrapper's lifecycle events
///
/// Handlers must not panic and must not assume exclusive access to the
/// wrapper while a callback runs.
pub trait PluginHandler: Send + Sync {
    fn on_config_update(&self, _config: &PluginConfig) {}

    fn on_plugin_start(&self, _plugin: &Arc<WasmPlugin>) {}

    fn on_plugin_destroy(&self, _plugin: &Arc<WasmPlugin>) {}
}

/// Handler that ignores every event
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPluginHandler;

impl PluginHandler for DefaultPluginHandler {}

struct WrapperState {
    plugin: Arc<WasmPlugin>,
    config: PluginConfig,
    handlers: Vec<Arc<dyn PluginHandler>>,
}

/// The active plugin of one name
pub struct PluginWrapper {
    name: String,
    state: RwLock<WrapperState>,
}

impl PluginWrapper {
    pub fn new(config: PluginConfig, plugin: Arc<WasmPlugin>) -> Self {
        Self {
            name: config.plugin_name.clone(),
            state: RwLock::new(WrapperState {
                plugin,
                config,
                handlers: Vec::new(),
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, WrapperState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, WrapperState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// The fixed plugin name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The active plugin
    pub fn plugin(&self) -> Arc<WasmPlugin> {
        Arc::clone(&self.read().plugin)
    }

    /// The current config
    pub fn config(&self) -> PluginConfig {
        self.read().config.clone()
    }

    fn handlers(&self) -> Vec<Arc<dyn PluginHandler>> {
        self.read().handlers.clone()
    }

    /// Number of registered handlers
    pub fn handler_count(&self) -> usize {
        self.read().handlers.len()
    }

    /// Register a handler and replay the current config and plugin to it
    pub fn register_plugin_handler(&self, handler: Arc<dyn PluginHandler>) {
        let (config, plugin) = {
            let mut state = self.write();
            state.handlers.push(Arc::clone(&handler));
            (state.config.clone(), Arc::clone(&state.plugin))
        };

        handler.on_config_update(&config);
        handler.on_plugin_start(&plugin);
    }

    /// Publish a new config and optionally a new plugin
    ///
    /// A config whose name is empty or differs from this wrapper's name is
    /// ignored. Passing `None`, or the plugin that is already active,
    /// updates only the config.
    pub fn update(&self, config: PluginConfig, plugin: Option<Arc<WasmPlugin>>) {
        if config.plugin_name.is_empty() || config.plugin_name != self.name {
            tracing::warn!(
                plugin = %self.name,
                requested = %config.plugin_name,
                "Ignoring update for a different plugin name"
            );
            return;
        }

        let handlers = self.handlers();
        for handler in &handlers {
            handler.on_config_update(&config);
        }
        self.write().config = config;

        let Some(plugin) = plugin else {
            return;
        };

        let old_plugin = self.plugin();
        if Arc::ptr_eq(&plugin, &old_plugin) {
            return;
        }

        for handler in &handlers {
            handler.on_plugin_start(&plugin);
        }

        self.write().plugin = Arc::clone(&plugin);
        tracing::info!(
            plugin = %self.name,
            old_id = old_plugin.id(),
            new_id = plugin.id(),
            "Swapped wasm plugin"
        );

        for handler in &handlers {
            handler.on_plugin_destroy(&old_plugin);
        }
        old_plugin.clear();
    }
}

impl fmt::Debug for PluginWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.read();
        f.debug_struct("PluginWrapper")
            .field("name", &self.name)
            .field("plugin", &state.plugin)
            .field("handlers", &state.handlers.len())
            .finish()
    }
}

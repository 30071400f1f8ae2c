//! Plugin loader
//!
//! Turns a [`PluginConfig`] into a ready [`WasmPlugin`]: resolve the engine,
//! fetch the bytes, compile the module, apply limits and fill the pool.
//! Any failure aborts the whole build so no half-built plugin escapes.

use crate::engine::EngineRegistry;
use crate::error::WasmError;
use crate::limits::{NoopLimiter, ResourceLimiter};
use crate::plugin::WasmPlugin;
use crate::source::{BytesLoader, FileLoader};
use proxy_wasm_api::PluginConfig;
use std::sync::Arc;

/// Builds plugins from configs
#[derive(Clone)]
pub struct PluginLoader {
    engines: EngineRegistry,
    bytes_loader: Arc<dyn BytesLoader>,
    limiter: Arc<dyn ResourceLimiter>,
}

impl PluginLoader {
    /// Create a loader over the given engines, reading modules from disk
    pub fn new(engines: EngineRegistry) -> Self {
        Self {
            engines,
            bytes_loader: Arc::new(FileLoader),
            limiter: Arc::new(NoopLimiter),
        }
    }

    /// Create a loader with the default engines
    pub fn with_defaults() -> Result<Self, WasmError> {
        Ok(Self::new(EngineRegistry::with_defaults()?))
    }

    /// Builder: replace the bytes loader
    pub fn with_bytes_loader(mut self, bytes_loader: Arc<dyn BytesLoader>) -> Self {
        self.bytes_loader = bytes_loader;
        self
    }

    /// Builder: replace the resource limiter
    pub fn with_limiter(mut self, limiter: Arc<dyn ResourceLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn engines(&self) -> &EngineRegistry {
        &self.engines
    }

    /// Build a plugin from `config`
    ///
    /// An `instance_num <= 0` is replaced by the available parallelism, and
    /// the returned plugin's config records the resolved value.
    pub fn load(&self, mut config: PluginConfig) -> Result<Arc<WasmPlugin>, WasmError> {
        let instance_num = config.resolved_instance_num();
        config.instance_num = i32::try_from(instance_num).unwrap_or(i32::MAX);

        let vm_config = config
            .vm_config
            .clone()
            .ok_or_else(|| WasmError::MissingVmConfig(config.plugin_name.clone()))?;

        let vm = self.engines.get(&vm_config.engine).inspect_err(|_| {
            tracing::error!(
                plugin = %config.plugin_name,
                engine = %vm_config.engine,
                "Failed to get wasm engine"
            );
        })?;

        let source = vm_config.source().ok_or_else(|| WasmError::BytesLoad {
            location: String::new(),
            source: anyhow::anyhow!("neither path nor url is set"),
        });
        let wasm_bytes = source
            .and_then(|source| {
                let location = source.to_string();
                match self.bytes_loader.load(source) {
                    Ok(bytes) if bytes.is_empty() => Err(WasmError::BytesLoad {
                        location,
                        source: anyhow::anyhow!("module is empty"),
                    }),
                    Ok(bytes) => Ok(bytes),
                    Err(source) => Err(WasmError::BytesLoad { location, source }),
                }
            })
            .inspect_err(|e| {
                tracing::error!(plugin = %config.plugin_name, error = %e, "Failed to load wasm bytes");
            })?;

        let module = vm
            .new_module(&wasm_bytes)
            .map_err(WasmError::ModuleCreate)
            .inspect_err(|e| {
                tracing::error!(plugin = %config.plugin_name, error = %e, "Failed to create module");
            })?;

        let plugin = WasmPlugin::from_module(config, vm, module, Arc::clone(&self.limiter));
        plugin.set_cpu_limit(vm_config.cpu);
        plugin.set_mem_limit(vm_config.mem);

        let actual = plugin.ensure_instance_num(instance_num);
        if actual == 0 {
            tracing::error!(
                plugin = %plugin.plugin_name(),
                wanted = instance_num,
                "Failed to ensure instance num, got 0"
            );
            return Err(WasmError::InstanceCreate {
                plugin: plugin.plugin_name().to_string(),
                wanted: instance_num,
            });
        }

        tracing::info!(
            plugin = %plugin.plugin_name(),
            id = plugin.id(),
            engine = %vm_config.engine,
            instances = actual,
            "Wasm plugin created"
        );
        Ok(Arc::new(plugin))
    }
}

impl std::fmt::Debug for PluginLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginLoader")
            .field("engines", &self.engines)
            .finish_non_exhaustive()
    }
}

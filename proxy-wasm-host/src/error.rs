//! Errors of plugin construction and registry operations

use thiserror::Error;

/// Errors that can occur while building, resizing or managing plugins
#[derive(Debug, Error)]
pub enum WasmError {
    #[error("Engine creation failed: {0}")]
    EngineCreation(#[source] anyhow::Error),

    #[error("Wasm engine not found: {0}")]
    EngineNotFound(String),

    #[error("Plugin {0} has no vm config")]
    MissingVmConfig(String),

    #[error("Failed to load wasm bytes from {location}: {source}")]
    BytesLoad {
        location: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("Module creation failed: {0}")]
    ModuleCreate(#[source] anyhow::Error),

    #[error("Failed to create wasm instance for plugin {plugin}: wanted {wanted}, got 0")]
    InstanceCreate { plugin: String, wanted: usize },

    #[error("Wasm config without plugin name")]
    EmptyPluginName,

    #[error("Wasm plugin not found: {0}")]
    PluginNotFound(String),

    #[error("Wasm plugin {0} has no instance")]
    NoInstance(String),
}

impl WasmError {
    /// Whether the error happened while building a plugin
    pub fn is_construction_failure(&self) -> bool {
        matches!(
            self,
            Self::EngineCreation(_)
                | Self::EngineNotFound(_)
                | Self::MissingVmConfig(_)
                | Self::BytesLoad { .. }
                | Self::ModuleCreate(_)
                | Self::InstanceCreate { .. }
        )
    }
}

//! Execution engine seam
//!
//! The host never touches an engine's export table directly. An engine
//! compiles bytes into a [`WasmModule`], a module stamps out independent
//! [`WasmInstance`]s, and an instance resolves export names to opaque
//! [`ExportSlot`]s once so later calls skip the name lookup.
//!
//! ```text
//! WasmVm ──new_module(bytes)──► WasmModule ──new_instance()──► WasmInstance
//!                                                                │
//!                                        resolve_export(name) ◄──┤
//!                                        invoke(slot, args)   ◄──┘
//! ```

pub mod wasmtime_vm;

use crate::error::WasmError;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Handle to an export resolved on one particular instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSlot(pub u32);

/// A virtual machine able to compile extension modules
pub trait WasmVm: Send + Sync {
    /// Identifier used in `VmConfig::engine`
    fn name(&self) -> &str;

    /// Compile and validate a module
    fn new_module(&self, wasm_bytes: &[u8]) -> anyhow::Result<Arc<dyn WasmModule>>;
}

/// A compiled, immutable module shared by all of its instances
pub trait WasmModule: Send + Sync {
    /// Create an instance with its own memory and state
    fn new_instance(&self) -> anyhow::Result<Box<dyn WasmInstance>>;
}

/// One sandboxed execution context
///
/// Not internally synchronized; callers hold exclusive access for a call.
pub trait WasmInstance: Send {
    /// Resolve an exported function, `None` if the module does not export it
    fn resolve_export(&mut self, name: &str) -> Option<ExportSlot>;

    /// Call a resolved export with `i32` arguments.
    ///
    /// Returns the first result, if the export has one. Traps and type
    /// mismatches come back as the engine reported them.
    fn invoke(&mut self, slot: ExportSlot, args: &[i32]) -> anyhow::Result<Option<i32>>;
}

/// Engines available to plugin configs, keyed by name
#[derive(Clone, Default)]
pub struct EngineRegistry {
    engines: HashMap<String, Arc<dyn WasmVm>>,
}

impl EngineRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a registry with the wasmtime engine registered
    pub fn with_defaults() -> Result<Self, WasmError> {
        let mut registry = Self::new();
        let vm = wasmtime_vm::WasmtimeVm::new().map_err(WasmError::EngineCreation)?;
        registry.register(Arc::new(vm));
        Ok(registry)
    }

    /// Register an engine under its own name, replacing any previous one
    pub fn register(&mut self, vm: Arc<dyn WasmVm>) {
        let name = vm.name().to_string();
        if self.engines.insert(name.clone(), vm).is_some() {
            tracing::debug!(engine = %name, "Replaced wasm engine");
        }
    }

    /// Builder form of [`EngineRegistry::register`]
    pub fn with_engine(mut self, vm: Arc<dyn WasmVm>) -> Self {
        self.register(vm);
        self
    }

    /// Look up an engine by name
    pub fn get(&self, name: &str) -> Result<Arc<dyn WasmVm>, WasmError> {
        self.engines
            .get(name)
            .cloned()
            .ok_or_else(|| WasmError::EngineNotFound(name.to_string()))
    }

    /// Names of all registered engines
    pub fn names(&self) -> Vec<String> {
        self.engines.keys().cloned().collect()
    }
}

impl fmt::Debug for EngineRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineRegistry")
            .field("engines", &self.names())
            .finish()
    }
}

//! wasmtime-backed engine
//!
//! One [`Engine`] per VM. Imports are linked once per module into an
//! [`InstancePre`], so creating an instance only allocates a new [`Store`].
//! Imports the host does not provide (the proxy's host ABI functions live
//! above this layer) are defined as traps, which lets modules instantiate
//! and fail only if they actually call one.

use super::{ExportSlot, WasmInstance, WasmModule, WasmVm};
use anyhow::{anyhow, bail};
use std::sync::Arc;
use wasmtime::{Config, Engine, Func, Instance, InstancePre, Linker, Module, Store, Val};

#[cfg(feature = "wasi")]
use wasmtime_wasi::{preview1::WasiP1Ctx, WasiCtxBuilder};

/// Configuration for the wasmtime engine
#[derive(Debug, Clone)]
pub struct WasmtimeConfig {
    /// Maximum wasm stack size in bytes
    pub max_wasm_stack: usize,

    /// Define unresolved imports as trapping stubs instead of failing
    /// instantiation
    pub trap_unknown_imports: bool,
}

impl Default for WasmtimeConfig {
    fn default() -> Self {
        Self {
            max_wasm_stack: 1024 * 1024, // 1MB
            trap_unknown_imports: true,
        }
    }
}

/// Per-instance store data
struct HostState {
    #[cfg(feature = "wasi")]
    wasi: WasiP1Ctx,
}

impl HostState {
    fn new() -> Self {
        Self {
            #[cfg(feature = "wasi")]
            wasi: WasiCtxBuilder::new().build_p1(),
        }
    }
}

/// wasmtime engine registered as `"wasmtime"`
pub struct WasmtimeVm {
    engine: Engine,
    config: WasmtimeConfig,
}

impl WasmtimeVm {
    /// Engine identifier
    pub const NAME: &'static str = "wasmtime";

    /// Create an engine with default configuration
    pub fn new() -> anyhow::Result<Self> {
        Self::with_config(WasmtimeConfig::default())
    }

    /// Create an engine with the given configuration
    pub fn with_config(config: WasmtimeConfig) -> anyhow::Result<Self> {
        let mut engine_config = Config::new();
        engine_config.max_wasm_stack(config.max_wasm_stack);
        // Disable memory64 for wasm32 compatibility
        engine_config.wasm_memory64(false);

        let engine = Engine::new(&engine_config)?;
        Ok(Self { engine, config })
    }

    fn linker(&self, module: &Module) -> anyhow::Result<Linker<HostState>> {
        #[allow(unused_mut)]
        let mut linker = Linker::new(&self.engine);

        #[cfg(feature = "wasi")]
        wasmtime_wasi::preview1::add_to_linker_sync(&mut linker, |s| &mut s.wasi)?;

        if self.config.trap_unknown_imports {
            linker.define_unknown_imports_as_traps(module)?;
        }
        Ok(linker)
    }
}

impl WasmVm for WasmtimeVm {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn new_module(&self, wasm_bytes: &[u8]) -> anyhow::Result<Arc<dyn WasmModule>> {
        let module = Module::new(&self.engine, wasm_bytes)?;
        let instance_pre = self.linker(&module)?.instantiate_pre(&module)?;

        tracing::debug!(
            exports = module.exports().len(),
            imports = module.imports().len(),
            "Compiled wasm module"
        );

        Ok(Arc::new(WasmtimeModule {
            engine: self.engine.clone(),
            instance_pre,
        }))
    }
}

struct WasmtimeModule {
    engine: Engine,
    instance_pre: InstancePre<HostState>,
}

impl WasmModule for WasmtimeModule {
    fn new_instance(&self) -> anyhow::Result<Box<dyn WasmInstance>> {
        let mut store = Store::new(&self.engine, HostState::new());
        let instance = self.instance_pre.instantiate(&mut store)?;

        Ok(Box::new(WasmtimeInstance {
            store,
            instance,
            funcs: Vec::new(),
        }))
    }
}

struct WasmtimeInstance {
    store: Store<HostState>,
    instance: Instance,
    funcs: Vec<Func>,
}

impl WasmInstance for WasmtimeInstance {
    fn resolve_export(&mut self, name: &str) -> Option<ExportSlot> {
        let func = self.instance.get_func(&mut self.store, name)?;
        let slot = ExportSlot(u32::try_from(self.funcs.len()).ok()?);
        self.funcs.push(func);
        Some(slot)
    }

    fn invoke(&mut self, slot: ExportSlot, args: &[i32]) -> anyhow::Result<Option<i32>> {
        let func = usize::try_from(slot.0)
            .ok()
            .and_then(|idx| self.funcs.get(idx).copied())
            .ok_or_else(|| anyhow!("unknown export slot {}", slot.0))?;

        let params: Vec<Val> = args.iter().map(|&arg| Val::I32(arg)).collect();
        let result_count = func.ty(&self.store).results().len();
        let mut results: Vec<Val> = (0..result_count).map(|_| Val::I32(0)).collect();

        func.call(&mut self.store, &params, &mut results)?;

        match results.first() {
            None => Ok(None),
            Some(Val::I32(code)) => Ok(Some(*code)),
            Some(_) => bail!("export returned a non-i32 result"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_creation() {
        let vm = WasmtimeVm::new();
        assert!(vm.is_ok());
        assert_eq!(vm.unwrap().name(), "wasmtime");
    }

    #[test]
    fn test_invalid_module_is_rejected() {
        let vm = WasmtimeVm::new().unwrap();
        assert!(vm.new_module(b"not wasm").is_err());
    }

    #[test]
    fn test_instances_have_separate_state() {
        let vm = WasmtimeVm::new().unwrap();
        let module = vm
            .new_module(
                br#"(module
                    (global $n (mut i32) (i32.const 0))
                    (func (export "bump") (result i32)
                        global.get $n
                        i32.const 1
                        i32.add
                        global.set $n
                        global.get $n))"#,
            )
            .unwrap();

        let mut a = module.new_instance().unwrap();
        let mut b = module.new_instance().unwrap();
        let slot_a = a.resolve_export("bump").unwrap();
        let slot_b = b.resolve_export("bump").unwrap();

        assert_eq!(a.invoke(slot_a, &[]).unwrap(), Some(1));
        assert_eq!(a.invoke(slot_a, &[]).unwrap(), Some(2));
        assert_eq!(b.invoke(slot_b, &[]).unwrap(), Some(1));
        assert!(a.resolve_export("missing").is_none());
    }
}

//! proxy-wasm-host: extension runtime for a proxy-wasm capable proxy
//!
//! This crate loads extension modules, keeps a pool of instances per named
//! plugin, hot-swaps plugins on configuration changes, and forwards the
//! proxy-wasm ABI callbacks to an instance through a typed dispatcher.

pub mod abi;
pub mod engine;
pub mod error;
pub mod limits;
pub mod loader;
pub mod manager;
pub mod plugin;
pub mod source;
pub mod watcher;
pub mod wrapper;

pub use abi::{AbiDispatcher, AbiError};
pub use engine::{EngineRegistry, ExportSlot, WasmInstance, WasmModule, WasmVm};
pub use engine::wasmtime_vm::{WasmtimeConfig, WasmtimeVm};
pub use error::WasmError;
pub use limits::{NoopLimiter, ResourceLimiter};
pub use loader::PluginLoader;
pub use manager::WasmManager;
pub use plugin::{InstanceWrapper, WasmPlugin};
pub use source::{BytesLoader, FileLoader};
pub use watcher::{SourceWatcher, WatcherConfig, WatcherError};
pub use wrapper::{DefaultPluginHandler, PluginHandler, PluginWrapper};
pub use proxy_wasm_api::{AbiCall, Action, PluginConfig, VmConfig, WasmSource};

//! Shared fixtures: an in-memory engine that counts what it creates

#![allow(dead_code)]

use anyhow::bail;
use proxy_wasm_api::{AbiCall, PluginConfig, VmConfig, WasmSource};
use proxy_wasm_host::{
    BytesLoader, EngineRegistry, ExportSlot, PluginHandler, PluginLoader, WasmInstance,
    WasmManager, WasmModule, WasmPlugin, WasmVm,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Counters shared by every mock engine of a test
#[derive(Debug, Default)]
pub struct MockStats {
    pub modules: AtomicUsize,
    pub instances: AtomicUsize,
}

impl MockStats {
    pub fn modules(&self) -> usize {
        self.modules.load(Ordering::SeqCst)
    }

    pub fn instances(&self) -> usize {
        self.instances.load(Ordering::SeqCst)
    }
}

/// Engine whose modules can create at most `capacity` instances each
pub struct MockVm {
    name: String,
    stats: Arc<MockStats>,
    capacity: usize,
}

impl MockVm {
    pub fn new(name: &str, stats: Arc<MockStats>, capacity: usize) -> Self {
        Self {
            name: name.to_string(),
            stats,
            capacity,
        }
    }
}

impl WasmVm for MockVm {
    fn name(&self) -> &str {
        &self.name
    }

    fn new_module(&self, wasm_bytes: &[u8]) -> anyhow::Result<Arc<dyn WasmModule>> {
        if wasm_bytes == b"invalid" {
            bail!("invalid module");
        }
        self.stats.modules.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MockModule {
            stats: Arc::clone(&self.stats),
            capacity: self.capacity,
            created: AtomicUsize::new(0),
        }))
    }
}

struct MockModule {
    stats: Arc<MockStats>,
    capacity: usize,
    created: AtomicUsize,
}

impl WasmModule for MockModule {
    fn new_instance(&self) -> anyhow::Result<Box<dyn WasmInstance>> {
        if self.created.fetch_add(1, Ordering::SeqCst) >= self.capacity {
            bail!("instance capacity exhausted");
        }
        self.stats.instances.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockInstance::default()))
    }
}

/// Exports every ABI call except `proxy_on_tick`; code-yielding calls
/// return the sum of their arguments
#[derive(Default)]
struct MockInstance {
    exports: Vec<AbiCall>,
}

impl WasmInstance for MockInstance {
    fn resolve_export(&mut self, name: &str) -> Option<ExportSlot> {
        let call = AbiCall::from_export_name(name).filter(|c| *c != AbiCall::Tick)?;
        self.exports.push(call);
        Some(ExportSlot(self.exports.len() as u32 - 1))
    }

    fn invoke(&mut self, slot: ExportSlot, args: &[i32]) -> anyhow::Result<Option<i32>> {
        let call = self.exports[slot.0 as usize];
        if call == AbiCall::ForeignFunction {
            bail!("wasm trap: unreachable");
        }
        Ok(call.yields_code().then(|| args.iter().sum()))
    }
}

/// Serves fixed bytes for any source; `missing`, `empty` and `invalid` in the
/// location select the failure cases
pub struct MockBytesLoader;

impl BytesLoader for MockBytesLoader {
    fn load(&self, source: WasmSource<'_>) -> anyhow::Result<Vec<u8>> {
        let location = match source {
            WasmSource::Path(location) | WasmSource::Url(location) => location,
        };
        if location.contains("missing") {
            bail!("no such file: {}", location);
        }
        if location.contains("empty") {
            return Ok(Vec::new());
        }
        if location.contains("invalid") {
            return Ok(b"invalid".to_vec());
        }
        Ok(b"\0asm\x01\0\0\0".to_vec())
    }
}

/// Manager over two mock engines, `mock` and `mock2`
pub fn mock_manager(stats: &Arc<MockStats>, capacity: usize) -> WasmManager {
    WasmManager::new(mock_loader(stats, capacity))
}

pub fn mock_loader(stats: &Arc<MockStats>, capacity: usize) -> PluginLoader {
    let engines = EngineRegistry::new()
        .with_engine(Arc::new(MockVm::new("mock", Arc::clone(stats), capacity)))
        .with_engine(Arc::new(MockVm::new("mock2", Arc::clone(stats), capacity)));
    PluginLoader::new(engines).with_bytes_loader(Arc::new(MockBytesLoader))
}

pub fn config(name: &str, instance_num: i32) -> PluginConfig {
    PluginConfig::new(
        name,
        VmConfig::from_path(format!("/plugins/{}.wasm", name)).with_engine("mock"),
    )
    .with_instance_num(instance_num)
}

/// Lifecycle event seen by [`RecordingHandler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    ConfigUpdate(i32),
    Start(u64),
    Destroy(u64),
}

/// Records every lifecycle callback in order
#[derive(Default)]
pub struct RecordingHandler {
    events: Mutex<Vec<Event>>,
}

impl RecordingHandler {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl PluginHandler for RecordingHandler {
    fn on_config_update(&self, config: &PluginConfig) {
        self.events
            .lock()
            .unwrap()
            .push(Event::ConfigUpdate(config.instance_num));
    }

    fn on_plugin_start(&self, plugin: &Arc<WasmPlugin>) {
        self.events.lock().unwrap().push(Event::Start(plugin.id()));
    }

    fn on_plugin_destroy(&self, plugin: &Arc<WasmPlugin>) {
        self.events.lock().unwrap().push(Event::Destroy(plugin.id()));
    }
}

/// Install a test subscriber so `RUST_LOG` shows host logs
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

//! Instance pool of one compiled module
//!
//! A [`WasmPlugin`] owns a compiled module and a resizable list of
//! instances created from it. Instances are handed out round-robin and
//! returned through [`WasmPlugin::release_instance`]; the occupancy count
//! is an advisory gauge, not an admission mechanism.
//!
//! Shrinking only drops the pool's reference to the excess instances.
//! Callers that already hold one keep a valid handle until they release
//! it, but the pool does not wait for them.

use crate::abi::AbiDispatcher;
use crate::engine::{WasmModule, WasmVm};
use crate::error::WasmError;
use crate::limits::ResourceLimiter;
use proxy_wasm_api::{PluginConfig, VmConfig};
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

static NEXT_PLUGIN_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// One pooled instance with its ABI dispatcher
pub struct InstanceWrapper {
    id: u64,
    dispatcher: Mutex<AbiDispatcher>,
}

impl InstanceWrapper {
    fn new(dispatcher: AbiDispatcher) -> Self {
        Self {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            dispatcher: Mutex::new(dispatcher),
        }
    }

    /// Process-unique id of this instance
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Exclusive access to the instance for a sequence of ABI calls
    ///
    /// Two holders of the same instance serialize here instead of racing
    /// inside the sandbox.
    pub fn lock(&self) -> MutexGuard<'_, AbiDispatcher> {
        self.dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for InstanceWrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceWrapper").field("id", &self.id).finish()
    }
}

/// A compiled module plus its pool of instances
pub struct WasmPlugin {
    id: u64,
    config: PluginConfig,
    vm: Arc<dyn WasmVm>,
    module: Arc<dyn WasmModule>,
    limiter: Arc<dyn ResourceLimiter>,

    instances: RwLock<Vec<Arc<InstanceWrapper>>>,
    cursor: AtomicUsize,
    occupancy: AtomicI32,
    resize: Mutex<()>,

    cpu_limit: AtomicI32,
    mem_limit: AtomicI32,
}

impl WasmPlugin {
    /// Wrap an already compiled module with an empty pool
    ///
    /// Call [`WasmPlugin::ensure_instance_num`] to populate it.
    pub fn from_module(
        config: PluginConfig,
        vm: Arc<dyn WasmVm>,
        module: Arc<dyn WasmModule>,
        limiter: Arc<dyn ResourceLimiter>,
    ) -> Self {
        Self {
            id: NEXT_PLUGIN_ID.fetch_add(1, Ordering::Relaxed),
            config,
            vm,
            module,
            limiter,
            instances: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            occupancy: AtomicI32::new(0),
            resize: Mutex::new(()),
            cpu_limit: AtomicI32::new(0),
            mem_limit: AtomicI32::new(0),
        }
    }

    /// Process-unique id, distinguishes successive plugins of one name
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn plugin_name(&self) -> &str {
        &self.config.plugin_name
    }

    /// The config this plugin was built from
    pub fn config(&self) -> &PluginConfig {
        &self.config
    }

    pub fn vm_config(&self) -> Option<&VmConfig> {
        self.config.vm_config.as_ref()
    }

    /// Name of the engine that compiled the module
    pub fn engine_name(&self) -> &str {
        self.vm.name()
    }

    fn read_instances(&self) -> RwLockReadGuard<'_, Vec<Arc<InstanceWrapper>>> {
        self.instances.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_instances(&self) -> RwLockWriteGuard<'_, Vec<Arc<InstanceWrapper>>> {
        self.instances.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current pool size
    pub fn instance_num(&self) -> usize {
        self.read_instances().len()
    }

    /// Grow or shrink the pool to `num` instances and return the actual size
    ///
    /// `0` or the current size is a no-op. Growth is best effort: instances
    /// that fail to instantiate are logged and skipped.
    pub fn ensure_instance_num(&self, num: usize) -> usize {
        let _resize = self.resize.lock().unwrap_or_else(PoisonError::into_inner);

        let current = self.instance_num();
        if num == 0 || num == current {
            return current;
        }

        if num < current {
            let dropped = {
                let mut instances = self.write_instances();
                instances.split_off(num)
            };
            tracing::debug!(
                plugin = %self.plugin_name(),
                dropped = dropped.len(),
                "Shrunk instance pool"
            );
            return num;
        }

        let mut created = Vec::with_capacity(num - current);
        for i in 0..num - current {
            match self.module.new_instance() {
                Ok(instance) => {
                    created.push(Arc::new(InstanceWrapper::new(AbiDispatcher::new(instance))));
                }
                Err(e) => {
                    tracing::error!(
                        plugin = %self.plugin_name(),
                        index = i,
                        error = %e,
                        "Failed to create wasm instance"
                    );
                }
            }
        }

        let mut instances = self.write_instances();
        instances.extend(created);
        tracing::debug!(
            plugin = %self.plugin_name(),
            wanted = num,
            actual = instances.len(),
            "Grew instance pool"
        );
        instances.len()
    }

    /// Take the next instance in round-robin order
    pub fn get_instance(&self) -> Result<Arc<InstanceWrapper>, WasmError> {
        let instances = self.read_instances();
        if instances.is_empty() {
            return Err(WasmError::NoInstance(self.plugin_name().to_string()));
        }

        let idx = self.cursor.fetch_add(1, Ordering::Relaxed) % instances.len();
        self.occupancy.fetch_add(1, Ordering::AcqRel);

        Ok(Arc::clone(&instances[idx]))
    }

    /// Return an instance taken with [`WasmPlugin::get_instance`]
    ///
    /// Only updates the occupancy gauge; the instance is not checked
    /// against the pool.
    pub fn release_instance(&self, _instance: &InstanceWrapper) {
        self.occupancy.fetch_sub(1, Ordering::AcqRel);
    }

    /// Instances currently taken and not yet released
    pub fn occupancy(&self) -> i32 {
        self.occupancy.load(Ordering::Acquire)
    }

    /// Visit every instance in pool order until the visitor breaks
    pub fn exec<F>(&self, mut visit: F)
    where
        F: FnMut(&Arc<InstanceWrapper>) -> ControlFlow<()>,
    {
        let instances = self.read_instances();
        for instance in instances.iter() {
            if visit(instance).is_break() {
                break;
            }
        }
    }

    pub fn set_cpu_limit(&self, cpu: i32) {
        self.cpu_limit.store(cpu, Ordering::Relaxed);
        self.limiter.set_cpu_limit(self.plugin_name(), cpu);
    }

    pub fn set_mem_limit(&self, mem: i32) {
        self.mem_limit.store(mem, Ordering::Relaxed);
        self.limiter.set_mem_limit(self.plugin_name(), mem);
    }

    pub fn cpu_limit(&self) -> i32 {
        self.cpu_limit.load(Ordering::Relaxed)
    }

    pub fn mem_limit(&self) -> i32 {
        self.mem_limit.load(Ordering::Relaxed)
    }

    /// Drop every pooled instance
    ///
    /// Handles already taken stay usable until their holders drop them.
    /// A resize in progress finishes before the pool is emptied.
    pub fn clear(&self) {
        // Waits out a growth that would otherwise refill the pool
        let _resize = self.resize.lock().unwrap_or_else(PoisonError::into_inner);
        let dropped = std::mem::take(&mut *self.write_instances());
        tracing::debug!(
            plugin = %self.plugin_name(),
            id = self.id,
            dropped = dropped.len(),
            "Cleared wasm plugin"
        );
    }
}

impl fmt::Debug for WasmPlugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WasmPlugin")
            .field("id", &self.id)
            .field("name", &self.config.plugin_name)
            .field("engine", &self.vm.name())
            .field("instances", &self.instance_num())
            .field("occupancy", &self.occupancy())
            .finish()
    }
}

//! Resource limit seam
//!
//! Limits are recorded on the plugin and forwarded here. No enforcement
//! happens at this layer; a limiter that actually meters CPU or memory can
//! be plugged in without touching the pool or the registry.

/// Receives the CPU and memory limits configured for a plugin
pub trait ResourceLimiter: Send + Sync {
    fn set_cpu_limit(&self, _plugin_name: &str, _cpu: i32) {}

    fn set_mem_limit(&self, _plugin_name: &str, _mem: i32) {}
}

/// Accepts limits and does nothing with them
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLimiter;

impl ResourceLimiter for NoopLimiter {}

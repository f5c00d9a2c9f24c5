//! Runtime context.
//!
//! Mutable defaults that the host treats as process-wide live here, one
//! context per [`crate::Core`], so separate cores never observe each
//! other's settings.

use indexmap::IndexMap;
use mlx_engine::{Device, Engine, Stream};
use tracing::debug;

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeContext {
    default_device: Device,
    /// Default stream of each device seen so far
    streams: IndexMap<Device, Stream>,
    compile_enabled: bool,
}

impl RuntimeContext {
    pub fn new(engine: &dyn Engine, default_device: Device, compile_enabled: bool) -> Self {
        let mut streams = IndexMap::new();
        for device in [Device::cpu(), Device::gpu(), default_device] {
            streams.entry(device).or_insert_with(|| engine.default_stream(device));
        }
        Self {
            default_device,
            streams,
            compile_enabled,
        }
    }

    pub fn default_device(&self) -> Device {
        self.default_device
    }

    pub fn set_default_device(&mut self, device: Device) {
        debug!(%device, "default device changed");
        self.default_device = device;
    }

    /// Default stream of `device`; devices not seen before get stream 0
    pub fn default_stream(&self, device: Device) -> Stream {
        self.streams
            .get(&device)
            .copied()
            .unwrap_or_else(|| Stream::new(0, device))
    }

    /// Make `stream` the default of its device, and that device the default
    pub fn set_default_stream(&mut self, stream: Stream) {
        debug!(%stream, "default stream changed");
        self.streams.insert(stream.device, stream);
        self.default_device = stream.device;
    }

    /// Default stream of the default device
    pub fn current_stream(&self) -> Stream {
        self.default_stream(self.default_device)
    }

    pub fn compile_enabled(&self) -> bool {
        self.compile_enabled
    }

    pub fn set_compile_enabled(&mut self, enabled: bool) {
        self.compile_enabled = enabled;
    }
}

/// What a scoped stream override has to put back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedDefaults {
    pub device: Device,
    pub stream: Stream,
}

impl SavedDefaults {
    /// Snapshot the defaults that installing `target` would change
    pub fn capture(ctx: &RuntimeContext, target: Stream) -> Self {
        Self {
            device: ctx.default_device(),
            stream: ctx.default_stream(target.device),
        }
    }

    pub fn restore(self, ctx: &mut RuntimeContext) {
        ctx.set_default_stream(self.stream);
        ctx.set_default_device(self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_defaults_come_from_engine() {
        let engine = CpuEngine::new();
        let ctx = RuntimeContext::new(&engine, Device::cpu(), true);
        assert_eq!(ctx.default_device(), Device::cpu());
        assert_eq!(ctx.current_stream(), engine.default_stream(Device::cpu()));
        assert_eq!(ctx.default_stream(Device::gpu()), engine.default_stream(Device::gpu()));
    }

    #[test]
    fn test_set_default_stream_moves_device() {
        let engine = CpuEngine::new();
        let mut ctx = RuntimeContext::new(&engine, Device::cpu(), true);
        let gpu_stream = Stream::new(7, Device::gpu());
        ctx.set_default_stream(gpu_stream);
        assert_eq!(ctx.default_device(), Device::gpu());
        assert_eq!(ctx.current_stream(), gpu_stream);
    }

    #[test]
    fn test_saved_defaults_restore() {
        let engine = CpuEngine::new();
        let mut ctx = RuntimeContext::new(&engine, Device::cpu(), true);
        let original = ctx.clone();
        let target = Stream::new(3, Device::gpu());
        let saved = SavedDefaults::capture(&ctx, target);
        ctx.set_default_stream(target);
        saved.restore(&mut ctx);
        assert_eq!(ctx, original);
    }
}

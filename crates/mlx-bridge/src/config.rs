//! Bridge configuration.
//!
//! Settings are fixed when a [`crate::Core`] is created. Startup defaults
//! can be taken from the environment with [`BridgeConfig::from_env`].

use mlx_engine::{Device, Engine};
use tracing::{info, warn};

use crate::gvl::ReleaseStrategy;

/// Signatures kept per compiled function unless configured otherwise
pub const DEFAULT_COMPILE_CACHE: usize = 64;

#[derive(Debug, Clone, PartialEq)]
pub struct BridgeConfig {
    /// Device used when a call names none
    pub default_device: Device,
    /// Whether release windows are taken at all
    pub release_gvl: bool,
    pub release_strategy: ReleaseStrategy,
    pub compile_enabled: bool,
    /// Per compiled function; the oldest signature is evicted first
    pub max_compile_cache: usize,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            default_device: Device::cpu(),
            release_gvl: true,
            release_strategy: ReleaseStrategy::Worker,
            compile_enabled: true,
            max_compile_cache: DEFAULT_COMPILE_CACHE,
        }
    }
}

impl BridgeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_default_device(mut self, device: Device) -> Self {
        self.default_device = device;
        self
    }

    pub fn with_release_gvl(mut self, release: bool) -> Self {
        self.release_gvl = release;
        self
    }

    pub fn with_release_strategy(mut self, strategy: ReleaseStrategy) -> Self {
        self.release_strategy = strategy;
        self
    }

    pub fn with_compile_enabled(mut self, enabled: bool) -> Self {
        self.compile_enabled = enabled;
        self
    }

    pub fn with_max_compile_cache(mut self, max: usize) -> Self {
        self.max_compile_cache = max.max(1);
        self
    }

    /// Defaults from `MLX_DEFAULT_DEVICE` (or `DEVICE`) and `MLX_RELEASE_GVL`
    pub fn from_env(engine: &dyn Engine) -> Self {
        Self::from_lookup(|key| std::env::var(key).ok(), engine)
    }

    /// Like [`BridgeConfig::from_env`], reading variables through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>, engine: &dyn Engine) -> Self {
        let mut config = Self::default();

        let requested = lookup("MLX_DEFAULT_DEVICE").or_else(|| lookup("DEVICE"));
        if let Some(raw) = requested {
            let name = raw.trim().to_ascii_lowercase();
            config.default_device = match name.as_str() {
                "cpu" => Device::cpu(),
                "gpu" | "metal" if engine.metal_is_available() => Device::gpu(),
                "gpu" | "metal" => {
                    info!(requested = %name, "metal unavailable, using cpu");
                    Device::cpu()
                }
                _ => {
                    warn!(requested = %raw, "ignoring unknown default device");
                    Device::cpu()
                }
            };
        }

        if let Some(raw) = lookup("MLX_RELEASE_GVL") {
            match raw.trim().to_ascii_lowercase().as_str() {
                "0" | "false" => config.release_gvl = false,
                "1" | "true" => config.release_gvl = true,
                _ => warn!(value = %raw, "ignoring MLX_RELEASE_GVL"),
            }
        }

        info!(
            device = %config.default_device,
            release_gvl = config.release_gvl,
            "resolved bridge configuration"
        );
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mlx_cpu::CpuEngine;
    use pretty_assertions::assert_eq;

    fn lookup<'a>(vars: &'a [(&'a str, &'a str)]) -> impl Fn(&str) -> Option<String> + 'a {
        move |key| vars.iter().find(|(k, _)| *k == key).map(|(_, v)| v.to_string())
    }

    #[test]
    fn test_defaults() {
        let config = BridgeConfig::new();
        assert_eq!(config.default_device, Device::cpu());
        assert!(config.release_gvl);
        assert_eq!(config.release_strategy, ReleaseStrategy::Worker);
        assert_eq!(config.max_compile_cache, DEFAULT_COMPILE_CACHE);
    }

    #[test]
    fn test_builder() {
        let config = BridgeConfig::new()
            .with_release_gvl(false)
            .with_release_strategy(ReleaseStrategy::Inline)
            .with_max_compile_cache(0);
        assert!(!config.release_gvl);
        assert_eq!(config.release_strategy, ReleaseStrategy::Inline);
        assert_eq!(config.max_compile_cache, 1);
    }

    #[test]
    fn test_gpu_falls_back_without_metal() {
        let engine = CpuEngine::new();
        let config = BridgeConfig::from_lookup(lookup(&[("MLX_DEFAULT_DEVICE", "gpu")]), &engine);
        assert_eq!(config.default_device, Device::cpu());
    }

    #[test]
    fn test_device_variable_fallback_and_release_flag() {
        let engine = CpuEngine::new();
        let config = BridgeConfig::from_lookup(lookup(&[("DEVICE", "CPU"), ("MLX_RELEASE_GVL", "false")]), &engine);
        assert_eq!(config.default_device, Device::cpu());
        assert!(!config.release_gvl);
    }

    #[test]
    fn test_unknown_values_are_ignored() {
        let engine = CpuEngine::new();
        let config = BridgeConfig::from_lookup(lookup(&[("MLX_DEFAULT_DEVICE", "tpu"), ("MLX_RELEASE_GVL", "maybe")]), &engine);
        assert_eq!(config, BridgeConfig::default());
    }
}

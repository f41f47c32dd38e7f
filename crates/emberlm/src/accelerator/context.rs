use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use wgpu::{DeviceDescriptor, Instance, InstanceDescriptor, PowerPreference, RequestAdapterOptions};

use crate::error::EngineError;

/// How to pick the compute adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AcceleratorConfig {
    /// Prefer an integrated / low-power adapter over a discrete one.
    pub low_power: bool,
    /// Only accept the software fallback adapter.
    pub force_fallback_adapter: bool,
    /// Reject adapters whose name does not contain this string (case-insensitive).
    pub adapter_name: Option<String>,
}

/// Device and queue of the compute adapter, created once per process.
pub struct AcceleratorContext {
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    pub adapter_info: wgpu::AdapterInfo,
    pub limits: wgpu::Limits,
}

impl AcceleratorContext {
    pub async fn new(config: &AcceleratorConfig) -> Result<Arc<Self>> {
        let instance = Instance::new(&InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            flags: wgpu::InstanceFlags::empty(),
            ..Default::default()
        });

        let power_preference = if config.low_power {
            PowerPreference::LowPower
        } else {
            PowerPreference::HighPerformance
        };

        let adapter = instance
            .request_adapter(&RequestAdapterOptions {
                power_preference,
                force_fallback_adapter: config.force_fallback_adapter,
                compatible_surface: None,
            })
            .await
            .map_err(|e| EngineError::AcceleratorUnavailable(format!("no compute adapter: {e}")))?;

        let adapter_info = adapter.get_info();
        if let Some(wanted) = &config.adapter_name {
            if !adapter_info
                .name
                .to_lowercase()
                .contains(&wanted.to_lowercase())
            {
                return Err(EngineError::AcceleratorUnavailable(format!(
                    "adapter '{}' does not match '{}'",
                    adapter_info.name, wanted
                ))
                .into());
            }
        }

        let limits = adapter.limits();
        log::info!(
            "adapter: {} ({:?}, {:?}), max_binding={:.2}MB",
            adapter_info.name,
            adapter_info.device_type,
            adapter_info.backend,
            limits.max_storage_buffer_binding_size as f64 / 1_048_576.0,
        );

        let (device, queue) = adapter
            .request_device(&DeviceDescriptor {
                label: Some("emberlm_accelerator"),
                required_features: wgpu::Features::empty(),
                required_limits: limits.clone(),
                ..Default::default()
            })
            .await
            .map_err(|e| EngineError::AcceleratorUnavailable(format!("device request failed: {e}")))?;

        Ok(Arc::new(Self {
            device,
            queue,
            adapter_info,
            limits,
        }))
    }

    /// Largest buffer a kernel may bind, in bytes.
    pub fn max_binding_bytes(&self) -> u64 {
        (self.limits.max_storage_buffer_binding_size as u64).min(self.limits.max_buffer_size)
    }
}

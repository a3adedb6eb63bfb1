//! GPU device acquisition.
//!
//! Enumerates adapters, auto-selects one (discrete preferred, Vulkan
//! preferred) or honors an explicit index, and requests a device with BC
//! texture support so re-encoded textures can be bound by the RMSE kernel.

use std::sync::Arc;

use tracing::info;
use wgpu::{Backends, Device, Instance, Queue};

/// GPU information for display/selection
#[derive(Debug, Clone)]
pub struct GpuInfo {
    pub name: String,
    pub backend: String,
    pub device_type: String,
    pub adapter_index: usize,
}

impl std::fmt::Display for GpuInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}, {})", self.name, self.backend, self.device_type)
    }
}

/// Errors raised while acquiring a GPU device.
#[derive(Debug, thiserror::Error)]
pub enum GpuError {
    #[error("no GPU found on this system")]
    NoAdapter,
    #[error("GPU index {index} out of range (found {count} GPUs)")]
    AdapterIndexOutOfRange { index: usize, count: usize },
    #[error("failed to create GPU device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),
}

/// An acquired device/queue pair shared by the encode and reduce pipelines.
pub struct GpuContext {
    pub device: Arc<Device>,
    pub queue: Arc<Queue>,
    pub gpu_info: GpuInfo,
}

impl GpuContext {
    /// Acquire a context with automatic GPU selection
    pub fn new() -> Result<Self, GpuError> {
        Self::with_gpu_index(None)
    }

    /// Acquire a context on a specific GPU index
    pub fn with_gpu_index(gpu_index: Option<usize>) -> Result<Self, GpuError> {
        pollster::block_on(Self::new_async(gpu_index))
    }

    async fn new_async(gpu_index: Option<usize>) -> Result<Self, GpuError> {
        let instance = Instance::new(&wgpu::InstanceDescriptor {
            backends: Backends::VULKAN | Backends::DX12 | Backends::METAL,
            ..Default::default()
        });

        let adapters = instance.enumerate_adapters(Backends::all()).await;

        if adapters.is_empty() {
            return Err(GpuError::NoAdapter);
        }

        for (i, adapter) in adapters.iter().enumerate() {
            let info = adapter.get_info();
            info!(
                "GPU {}: {} ({:?}, {:?})",
                i, info.name, info.backend, info.device_type
            );
        }

        // Select adapter
        let (adapter_index, adapter) = if let Some(idx) = gpu_index {
            if idx >= adapters.len() {
                return Err(GpuError::AdapterIndexOutOfRange {
                    index: idx,
                    count: adapters.len(),
                });
            }
            (idx, &adapters[idx])
        } else {
            // Auto-select: prefer discrete GPU, then Vulkan backend
            adapters
                .iter()
                .enumerate()
                .max_by_key(|(_, a)| {
                    let info = a.get_info();
                    let mut score = 0i32;
                    if info.device_type == wgpu::DeviceType::DiscreteGpu {
                        score += 100;
                    }
                    if info.backend == wgpu::Backend::Vulkan {
                        score += 10;
                    }
                    score
                })
                .ok_or(GpuError::NoAdapter)?
        };

        let adapter_info = adapter.get_info();
        let gpu_info = GpuInfo {
            name: adapter_info.name.clone(),
            backend: format!("{:?}", adapter_info.backend),
            device_type: format!("{:?}", adapter_info.device_type),
            adapter_index,
        };

        info!(
            "Selected GPU: {} ({}, {})",
            gpu_info.name, gpu_info.backend, gpu_info.device_type
        );

        // BC sampling is needed to bind the re-encoded texture in the RMSE pass
        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("bcnkiln device"),
                required_features: wgpu::Features::TEXTURE_COMPRESSION_BC,
                required_limits: wgpu::Limits::default(),
                ..Default::default()
            })
            .await?;

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            gpu_info,
        })
    }

    /// Get GPU information
    pub fn info(&self) -> &GpuInfo {
        &self.gpu_info
    }
}

/// List available GPUs
pub fn list_gpus() -> Vec<GpuInfo> {
    pollster::block_on(list_gpus_async())
}

async fn list_gpus_async() -> Vec<GpuInfo> {
    let instance = Instance::new(&wgpu::InstanceDescriptor {
        backends: Backends::VULKAN | Backends::DX12 | Backends::METAL,
        ..Default::default()
    });

    let adapters = instance.enumerate_adapters(Backends::all()).await;

    adapters
        .iter()
        .enumerate()
        .map(|(idx, adapter)| {
            let info = adapter.get_info();
            GpuInfo {
                name: info.name.clone(),
                backend: format!("{:?}", info.backend),
                device_type: format!("{:?}", info.device_type),
                adapter_index: idx,
            }
        })
        .collect()
}

/// Check if GPU acceleration is available
pub fn is_gpu_available() -> bool {
    !list_gpus().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_gpus() {
        let gpus = list_gpus();
        println!("Found {} GPUs:", gpus.len());
        for gpu in &gpus {
            println!("  - {}", gpu);
        }
    }

    #[test]
    fn test_gpu_available_matches_list() {
        assert_eq!(is_gpu_available(), !list_gpus().is_empty());
    }
}

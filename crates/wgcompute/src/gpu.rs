//! Device bootstrap.

use std::sync::Arc;
use wgpu::{Adapter, AdapterInfo, Backends, Device, Limits, Queue};

/// A `wgpu` device and its queue, created from the best adapter available.
pub struct GpuInstance {
    _instance: wgpu::Instance,
    adapter: Adapter,
    info: AdapterInfo,
    device: Arc<Device>,
    queue: Queue,
}

impl GpuInstance {
    /// Opens a device on any backend.
    pub async fn new() -> anyhow::Result<Self> {
        Self::with_backends(Backends::all()).await
    }

    /// Opens a device on any backend but OpenGL, whose compute support is limited.
    pub async fn without_gl() -> anyhow::Result<Self> {
        Self::with_backends(Backends::all() - Backends::GL).await
    }

    /// Opens a device on one of `backends`, preferring high-performance adapters.
    ///
    /// Buffer size limits are raised to what the adapter supports: a whole particle set, or a
    /// whole key array, must fit in a single storage binding.
    pub async fn with_backends(backends: Backends) -> anyhow::Result<Self> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends,
            ..Default::default()
        });
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                ..Default::default()
            })
            .await
            .map_err(|e| anyhow::anyhow!("no suitable gpu adapter: {e}"))?;

        let info = adapter.get_info();
        let supported = adapter.limits();
        let required_limits = Limits {
            max_buffer_size: supported.max_buffer_size,
            max_storage_buffer_binding_size: supported.max_storage_buffer_binding_size,
            ..Limits::default()
        };
        log::info!(
            "gpu adapter: {} ({:?}, {:?}), max storage binding: {} bytes",
            info.name,
            info.backend,
            info.device_type,
            required_limits.max_storage_buffer_binding_size
        );

        let (device, queue) = adapter
            .request_device(&wgpu::DeviceDescriptor {
                label: Some("wgcompute"),
                required_features: wgpu::Features::empty(),
                required_limits,
                memory_hints: wgpu::MemoryHints::Performance,
                trace: wgpu::Trace::Off,
            })
            .await?;

        Ok(Self {
            _instance: instance,
            adapter,
            info,
            device: Arc::new(device),
            queue,
        })
    }

    /// The adapter the device was created from.
    pub fn adapter(&self) -> &Adapter {
        &self.adapter
    }

    /// Name, backend and type of the adapter.
    pub fn info(&self) -> &AdapterInfo {
        &self.info
    }

    /// The device.
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The device, for callers that need to keep it alive on their own.
    pub fn device_arc(&self) -> Arc<Device> {
        self.device.clone()
    }

    /// The queue of the device.
    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    /// Size, in bytes, of the largest buffer a kernel can bind as storage.
    pub fn max_storage_binding_size(&self) -> u64 {
        self.device.limits().max_storage_buffer_binding_size as u64
    }
}

//! Headless GPU context management using wgpu

use crate::core::error::Error;

/// GPU compute context (no surface; output is read back or written to disk)
pub struct GpuContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: wgpu::Device,
    pub queue: wgpu::Queue,
    /// Adapter supports timestamp queries (enables `GpuProfiler`)
    pub timestamps: bool,
}

impl GpuContext {
    /// Request an adapter and device without a window
    pub async fn new() -> Result<Self, Error> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::PRIMARY,
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| Error::Gpu(format!("No suitable adapter found: {:?}", e)))?;

        let adapter_limits = adapter.limits();
        let timestamps = adapter.features().contains(wgpu::Features::TIMESTAMP_QUERY);
        let required_features = if timestamps {
            wgpu::Features::TIMESTAMP_QUERY
        } else {
            wgpu::Features::empty()
        };

        let device_desc = wgpu::DeviceDescriptor {
            label: Some("surfel_gi_device"),
            required_features,
            required_limits: wgpu::Limits {
                // Surfel pool at 1M surfels is 68MB
                max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
                max_buffer_size: adapter_limits.max_buffer_size,
                ..Default::default()
            },
            memory_hints: wgpu::MemoryHints::Performance,
            experimental_features: Default::default(),
            trace: Default::default(),
        };

        let (device, queue) = adapter
            .request_device(&device_desc)
            .await
            .map_err(|e| Error::Gpu(e.to_string()))?;

        let info = adapter.get_info();
        log::info!("GPU adapter: {} ({:?})", info.name, info.backend);
        log::info!("GPU buffer limits: max_buffer_size={}MB, max_storage_binding={}MB, timestamps={}",
            adapter_limits.max_buffer_size / 1024 / 1024,
            adapter_limits.max_storage_buffer_binding_size / 1024 / 1024,
            timestamps);

        Ok(Self {
            instance,
            adapter,
            device,
            queue,
            timestamps,
        })
    }

    /// Blocking constructor for tools and tests
    pub fn headless() -> Result<Self, Error> {
        pollster::block_on(Self::new())
    }

    /// Wait for all submitted work to finish
    pub fn wait_idle(&self) -> Result<(), Error> {
        self.device
            .poll(wgpu::PollType::Wait { submission_index: None, timeout: None })
            .map(|_| ())
            .map_err(|e| Error::Gpu(format!("device poll failed: {:?}", e)))
    }
}

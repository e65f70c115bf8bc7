//! wgpu device, queue, and the compiled unmix pipeline.

use std::sync::Arc;
use thiserror::Error;

/// WGSL source of the unmix kernel
const UNMIX_SHADER: &str = include_str!("unmix.wgsl");

/// Entry point of the unmix kernel
const UNMIX_ENTRY_POINT: &str = "unmix_pixels";

/// Errors that can occur during GPU operations.
#[derive(Debug, Clone, Error)]
pub enum GpuError {
    #[error("No suitable GPU adapter found")]
    NoAdapter,
    #[error("Failed to request GPU device: {0}")]
    DeviceRequest(String),
    #[error("Buffer operation failed: {0}")]
    BufferError(String),
    #[error("Image too large for the GPU: {0}")]
    TooLarge(String),
}

/// GPU context holding the wgpu device, queue, and the unmix pipeline.
pub struct GpuContext {
    pub(crate) device: Arc<wgpu::Device>,
    pub(crate) queue: Arc<wgpu::Queue>,
    pub(crate) pipeline: wgpu::ComputePipeline,
    pub(crate) layout: wgpu::BindGroupLayout,
    adapter_info: wgpu::AdapterInfo,
}

fn instance() -> wgpu::Instance {
    wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        ..Default::default()
    })
}

async fn request_adapter(instance: &wgpu::Instance) -> Option<wgpu::Adapter> {
    instance
        .request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::HighPerformance,
            compatible_surface: None,
            force_fallback_adapter: false,
        })
        .await
}

impl GpuContext {
    /// Check if an adapter exists without creating a device.
    pub fn is_available() -> bool {
        let instance = instance();
        pollster::block_on(request_adapter(&instance)).is_some()
    }

    /// Get information about the available GPU adapter.
    pub fn device_info() -> Option<String> {
        let instance = instance();
        pollster::block_on(request_adapter(&instance)).map(|adapter| {
            let info = adapter.get_info();
            format!("{} ({:?}, {:?})", info.name, info.device_type, info.backend)
        })
    }

    /// Create a context, blocking until the device is ready.
    pub fn new() -> Result<Self, GpuError> {
        pollster::block_on(Self::new_async())
    }

    pub async fn new_async() -> Result<Self, GpuError> {
        let instance = instance();
        let adapter = request_adapter(&instance)
            .await
            .ok_or(GpuError::NoAdapter)?;
        let adapter_info = adapter.get_info();

        // Large images need more than the default storage binding size
        let adapter_limits = adapter.limits();
        let limits = wgpu::Limits {
            max_storage_buffer_binding_size: adapter_limits.max_storage_buffer_binding_size,
            max_buffer_size: adapter_limits.max_buffer_size,
            ..wgpu::Limits::downlevel_defaults()
        };

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("colormapper-gpu"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits,
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| GpuError::DeviceRequest(e.to_string()))?;

        let (pipeline, layout) = Self::create_pipeline(&device);

        tracing::debug!(
            adapter = %adapter_info.name,
            backend = ?adapter_info.backend,
            "Created GPU context"
        );

        Ok(Self {
            device: Arc::new(device),
            queue: Arc::new(queue),
            pipeline,
            layout,
            adapter_info,
        })
    }

    pub fn adapter_info(&self) -> &wgpu::AdapterInfo {
        &self.adapter_info
    }

    fn create_pipeline(device: &wgpu::Device) -> (wgpu::ComputePipeline, wgpu::BindGroupLayout) {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("unmix"),
            source: wgpu::ShaderSource::Wgsl(UNMIX_SHADER.into()),
        });

        let storage = |binding, read_only| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("unmix_layout"),
            entries: &[
                // Normalized pixels (read-only)
                storage(0, true),
                // Component intensities
                storage(1, false),
                // Per-pixel iteration status
                storage(2, false),
                // Solver parameters
                wgpu::BindGroupLayoutEntry {
                    binding: 3,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("unmix_pipeline_layout"),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });

        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some("unmix"),
            layout: Some(&pipeline_layout),
            module: &module,
            entry_point: Some(UNMIX_ENTRY_POINT),
            compilation_options: Default::default(),
            cache: None,
        });

        (pipeline, layout)
    }

    /// Submit a command encoder and wait for completion.
    pub fn submit_and_wait(&self, encoder: wgpu::CommandEncoder) {
        self.queue.submit(std::iter::once(encoder.finish()));
        self.device.poll(wgpu::Maintain::Wait);
    }
}

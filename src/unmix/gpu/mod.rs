//! GPU backend for the unmix solve.
//!
//! Runs the same iteration as [`solve_pixel`](super::solve_pixel) as one wgpu
//! compute dispatch over all pixels (Metal on macOS, Vulkan on Linux/Windows,
//! DX12 on Windows). Enabled by the default `gpu` feature.

mod buffers;
mod context;
mod pipeline;

pub use context::{GpuContext, GpuError};
pub use pipeline::GpuUnmixer;

/// Check if a GPU adapter is available on this system.
pub fn is_gpu_available() -> bool {
    GpuContext::is_available()
}

/// Describe the adapter that would be used, if any.
pub fn gpu_info() -> Option<String> {
    GpuContext::device_info()
}

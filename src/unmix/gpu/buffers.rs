//! GPU buffer management for pixels, results, and solver parameters.

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use super::context::{GpuContext, GpuError};
use crate::matrix::{BACKGROUND, NUCLEI};
use crate::unmix::UnmixProblem;

/// Solver parameters as laid out in the kernel's `Params` uniform.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct SolverUniforms {
    pub background: [f32; 4],
    pub nuclei: [f32; 4],
    /// q00, q01, q11, gradient step
    pub gram: [f32; 4],
    /// i00, i01, i11, unused
    pub inverse: [f32; 4],
    pub tolerance_squared: f32,
    pub max_iterations: u32,
    pub pixel_count: u32,
    pub use_newton: u32,
}

impl SolverUniforms {
    pub fn new(problem: &UnmixProblem, pixel_count: u32) -> Self {
        let [b0, b1, b2] = problem.mixing.column(BACKGROUND);
        let [n0, n1, n2] = problem.mixing.column(NUCLEI);
        let [q00, q01, q11] = problem.gram;
        let [i00, i01, i11] = problem.inverse.unwrap_or([0.0; 3]);

        Self {
            background: [b0, b1, b2, 0.0],
            nuclei: [n0, n1, n2, 0.0],
            gram: [q00, q01, q11, problem.gradient_step],
            inverse: [i00, i01, i11, 0.0],
            tolerance_squared: problem.tolerance_squared,
            max_iterations: problem.max_iterations,
            pixel_count,
            use_newton: problem.inverse.is_some() as u32,
        }
    }
}

/// Upload a slice into a new buffer with the given usage.
pub fn create_buffer_init<T: Pod>(
    ctx: &GpuContext,
    label: &str,
    contents: &[T],
    usage: wgpu::BufferUsages,
) -> wgpu::Buffer {
    ctx.device
        .create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: bytemuck::cast_slice(contents),
            usage,
        })
}

/// Allocate an uninitialized storage buffer that can be copied out.
pub fn create_output_buffer(ctx: &GpuContext, label: &str, size: u64) -> wgpu::Buffer {
    ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size,
        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_SRC,
        mapped_at_creation: false,
    })
}

/// Fail early if a binding would exceed the device's storage limit.
pub fn check_binding_size(ctx: &GpuContext, label: &str, size: u64) -> Result<(), GpuError> {
    let limit = ctx.device.limits().max_storage_buffer_binding_size as u64;
    if size > limit {
        return Err(GpuError::TooLarge(format!(
            "{} needs {} bytes, the device allows {}",
            label, size, limit
        )));
    }
    Ok(())
}

/// Copy a GPU buffer to the CPU.
pub fn download<T: Pod>(ctx: &GpuContext, buffer: &wgpu::Buffer, size: u64) -> Result<Vec<T>, GpuError> {
    let staging_buffer = ctx.device.create_buffer(&wgpu::BufferDescriptor {
        label: Some("staging_readback"),
        size,
        usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
        mapped_at_creation: false,
    });

    let mut encoder = ctx
        .device
        .create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("download_encoder"),
        });
    encoder.copy_buffer_to_buffer(buffer, 0, &staging_buffer, 0, size);
    ctx.queue.submit(std::iter::once(encoder.finish()));

    let buffer_slice = staging_buffer.slice(..);
    let (tx, rx) = std::sync::mpsc::channel();
    buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
        // If the receiver is gone, recv() below reports the failure
        let _ = tx.send(result);
    });

    ctx.device.poll(wgpu::Maintain::Wait);

    rx.recv()
        .map_err(|e| GpuError::BufferError(e.to_string()))?
        .map_err(|e| GpuError::BufferError(e.to_string()))?;

    let data = buffer_slice.get_mapped_range();
    let result: Vec<T> = bytemuck::cast_slice(&data).to_vec();

    drop(data);
    staging_buffer.unmap();

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::MixingMatrix;
    use crate::unmix::SolverSettings;

    #[test]
    fn test_uniform_layout_matches_wgsl() {
        // Four vec4<f32> followed by four 32-bit scalars
        assert_eq!(std::mem::size_of::<SolverUniforms>(), 80);
        assert_eq!(std::mem::size_of::<SolverUniforms>() % 16, 0);
    }

    #[test]
    fn test_uniforms_carry_problem() {
        let mixing = MixingMatrix::from_colors([255, 0, 0], [0, 0, 255]);
        let problem = UnmixProblem::new(&mixing, &SolverSettings::default());
        let uniforms = SolverUniforms::new(&problem, 12);

        assert_eq!(uniforms.background, [1.0, 0.0, 0.0, 0.0]);
        assert_eq!(uniforms.nuclei, [0.0, 0.0, 1.0, 0.0]);
        assert_eq!(uniforms.gram, [1.0, 0.0, 1.0, 1.0]);
        assert_eq!(uniforms.inverse, [1.0, 0.0, 1.0, 0.0]);
        assert_eq!(uniforms.max_iterations, 100);
        assert_eq!(uniforms.pixel_count, 12);
        assert_eq!(uniforms.use_newton, 1);
    }
}

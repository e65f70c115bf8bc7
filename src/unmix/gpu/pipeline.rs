//! Upload, dispatch, and read-back of one unmix solve.

use image::RgbImage;
use tracing::debug;

use super::buffers::{
    SolverUniforms, check_binding_size, create_buffer_init, create_output_buffer, download,
};
use super::context::{GpuContext, GpuError};
use crate::color::normalize_color;
use crate::unmix::{BackendOutput, UnmixProblem};

/// Threads per workgroup; must match `@workgroup_size` in the kernel
pub const WORKGROUP_SIZE: u32 = 256;

/// Maximum workgroups per dispatch dimension (WebGPU limit)
pub const MAX_WORKGROUPS_PER_DIM: u32 = 65535;

/// Reusable GPU solver. Creating the context compiles the kernel, so keep one
/// around when unmixing several images.
pub struct GpuUnmixer {
    ctx: GpuContext,
}

impl GpuUnmixer {
    pub fn new() -> Result<Self, GpuError> {
        Ok(Self {
            ctx: GpuContext::new()?,
        })
    }

    /// Solve every pixel of `image` in a single dispatch and wait for the result.
    pub fn solve(&self, image: &RgbImage, problem: &UnmixProblem) -> Result<BackendOutput, GpuError> {
        let (width, height) = image.dimensions();
        let pixel_count = width as usize * height as usize;
        if pixel_count == 0 {
            return Ok(BackendOutput::default());
        }
        let pixel_count_u32 = u32::try_from(pixel_count)
            .map_err(|_| GpuError::TooLarge(format!("{} pixels", pixel_count)))?;

        // Normalize on the host so both backends see bit-identical inputs
        let pixels: Vec<f32> = image
            .pixels()
            .flat_map(|p| normalize_color(p.0))
            .collect();

        let pixel_bytes = std::mem::size_of_val(pixels.as_slice()) as u64;
        let component_bytes = (pixel_count * std::mem::size_of::<[f32; 2]>()) as u64;
        let status_bytes = (pixel_count * std::mem::size_of::<u32>()) as u64;
        check_binding_size(&self.ctx, "pixel buffer", pixel_bytes)?;
        check_binding_size(&self.ctx, "component buffer", component_bytes)?;

        let (groups_x, groups_y) = dispatch_grid(pixel_count_u32)?;
        debug!(
            adapter = %self.ctx.adapter_info().name,
            pixel_count,
            groups_x,
            groups_y,
            "Dispatching unmix kernel"
        );

        let pixel_buffer = create_buffer_init(
            &self.ctx,
            "pixels",
            &pixels,
            wgpu::BufferUsages::STORAGE,
        );
        let uniforms = [SolverUniforms::new(problem, pixel_count_u32)];
        let uniform_buffer = create_buffer_init(
            &self.ctx,
            "solver_params",
            &uniforms,
            wgpu::BufferUsages::UNIFORM,
        );
        let component_buffer = create_output_buffer(&self.ctx, "components", component_bytes);
        let status_buffer = create_output_buffer(&self.ctx, "statuses", status_bytes);

        let bind_group = self.ctx.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("unmix_bind_group"),
            layout: &self.ctx.layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: pixel_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: component_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: status_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 3,
                    resource: uniform_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = self
            .ctx
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("unmix_encoder"),
            });
        {
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("unmix_pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(&self.ctx.pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups_x, groups_y, 1);
        }
        self.ctx.submit_and_wait(encoder);

        let components: Vec<[f32; 2]> = download(&self.ctx, &component_buffer, component_bytes)?;
        let statuses: Vec<u32> = download(&self.ctx, &status_buffer, status_bytes)?;

        Ok(BackendOutput {
            components,
            statuses,
        })
    }
}

/// Workgroup grid covering `pixel_count` invocations. Large images use a
/// roughly square 2-D grid; the kernel flattens it back with `num_workgroups`.
pub fn dispatch_grid(pixel_count: u32) -> Result<(u32, u32), GpuError> {
    let total_workgroups = pixel_count.div_ceil(WORKGROUP_SIZE);
    if total_workgroups <= MAX_WORKGROUPS_PER_DIM {
        return Ok((total_workgroups, 1));
    }

    let side = ((total_workgroups as f64).sqrt().ceil() as u32).min(MAX_WORKGROUPS_PER_DIM);
    let rows = total_workgroups.div_ceil(side);
    if rows > MAX_WORKGROUPS_PER_DIM {
        return Err(GpuError::TooLarge(format!(
            "{} pixels need {} workgroups",
            pixel_count, total_workgroups
        )));
    }
    Ok((side, rows))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_small_images_use_one_row_of_workgroups() {
        assert_eq!(dispatch_grid(1).unwrap(), (1, 1));
        assert_eq!(dispatch_grid(256).unwrap(), (1, 1));
        assert_eq!(dispatch_grid(257).unwrap(), (2, 1));
        assert_eq!(dispatch_grid(256 * 65535).unwrap(), (65535, 1));
    }

    #[test]
    fn test_large_images_use_a_2d_grid() {
        let pixels = 8000 * 6000;
        let (x, y) = dispatch_grid(pixels).unwrap();
        assert!(y > 1);
        assert!(x as u64 * y as u64 * WORKGROUP_SIZE as u64 >= pixels as u64);
    }
}

//! Per-pixel non-negative least-squares decomposition into two reference colors.
//!
//! Every pixel `b` is explained as `A·x` with `x ≥ 0`, where the columns of `A`
//! are the background and nuclei colors. Both backends run the same projected
//! iteration, defined once by [`UnmixProblem`] and [`solve_pixel`]; the GPU
//! kernel in `gpu/unmix.wgsl` mirrors `solve_pixel` statement for statement.

#[cfg(feature = "gpu")]
pub mod gpu;
pub mod tiles;

use clap::ValueEnum;
use image::RgbImage;
use nalgebra::{Vector2, Vector3};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::color::CHANNEL_MAX;
use crate::error::{ColormapError, Result, invalid};
use crate::matrix::{MixingMatrix, largest_eigenvalue};

/// Default convergence threshold, in 8-bit intensity levels
pub const DEFAULT_TOLERANCE: f32 = 0.1;

/// Default iteration cap per pixel
pub const DEFAULT_MAX_ITERATIONS: u32 = 100;

/// Default edge length of a CPU tile, in pixels
pub const DEFAULT_TILE_SIZE: u32 = 64;

/// Newton steps are used while `det(AᵀA)` stays above this fraction of
/// `‖a₀‖²‖a₁‖²`; below it the Lipschitz gradient step takes over.
const NEWTON_DET_EPSILON: f32 = 1e-5;

/// Where the per-pixel solve runs
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// One compute dispatch over every pixel
    #[default]
    Gpu,
    /// Rectangular tiles solved in parallel on the CPU
    #[value(name = "cpu")]
    #[serde(rename = "cpu")]
    CpuTiled,
}

impl std::fmt::Display for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Gpu => write!(f, "gpu"),
            Backend::CpuTiled => write!(f, "cpu"),
        }
    }
}

/// Invocation parameters of the solver
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverSettings {
    /// Convergence threshold on the change of the reconstructed color between
    /// two iterations, in 8-bit intensity levels
    pub tolerance: f32,
    pub max_iterations: u32,
    /// Edge length of CPU tiles. Ignored by the GPU backend.
    pub tile_size: u32,
}

impl Default for SolverSettings {
    fn default() -> Self {
        Self {
            tolerance: DEFAULT_TOLERANCE,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            tile_size: DEFAULT_TILE_SIZE,
        }
    }
}

impl SolverSettings {
    pub fn validate(&self) -> Result<()> {
        if !self.tolerance.is_finite() || self.tolerance <= 0.0 {
            return Err(invalid(format!(
                "tolerance must be a positive number, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(invalid("max_iterations must be at least 1"));
        }
        if self.tile_size == 0 {
            return Err(invalid("tile_size must be at least 1"));
        }
        Ok(())
    }
}

/// Everything the per-pixel iteration needs, precomputed once per matrix
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnmixProblem {
    pub mixing: MixingMatrix,
    /// Entries of `AᵀA`: `[q00, q01, q11]`
    pub gram: [f32; 3],
    /// `1 / λmax(AᵀA)`, or 0 when both columns are black
    pub gradient_step: f32,
    /// Entries of `(AᵀA)⁻¹`: `[i00, i01, i11]`, absent when the matrix is
    /// too close to singular for a Newton step
    pub inverse: Option<[f32; 3]>,
    /// Squared tolerance in normalized units
    pub tolerance_squared: f32,
    pub max_iterations: u32,
}

impl UnmixProblem {
    pub fn new(mixing: &MixingMatrix, settings: &SolverSettings) -> Self {
        let q = mixing.gram();
        let (q00, q01, q11) = (q[(0, 0)], q[(0, 1)], q[(1, 1)]);

        let lipschitz = largest_eigenvalue(&q);
        let gradient_step = if lipschitz > 0.0 { 1.0 / lipschitz } else { 0.0 };

        let det = q00 * q11 - q01 * q01;
        let inverse = (det > NEWTON_DET_EPSILON * q00 * q11)
            .then(|| [q11 / det, -q01 / det, q00 / det]);

        let tolerance = settings.tolerance / CHANNEL_MAX;

        Self {
            mixing: *mixing,
            gram: [q00, q01, q11],
            gradient_step,
            inverse,
            tolerance_squared: tolerance * tolerance,
            max_iterations: settings.max_iterations,
        }
    }

    /// Step taken when both components are free
    fn full_step(&self, g: Vector2<f32>) -> Vector2<f32> {
        match self.inverse {
            Some([i00, i01, i11]) => -Vector2::new(i00 * g[0] + i01 * g[1], i01 * g[0] + i11 * g[1]),
            None => -self.gradient_step * g,
        }
    }
}

/// Exact minimizer along one axis
fn axis_step(g: f32, q: f32) -> f32 {
    if q > 0.0 { -g / q } else { 0.0 }
}

/// Outcome of the iteration for one pixel
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PixelSolution {
    pub components: [f32; 2],
    pub iterations: u32,
    pub converged: bool,
}

impl PixelSolution {
    /// Compact status shared with the GPU kernel: the iteration count on
    /// convergence, 0 when the iteration cap was hit
    pub fn status(&self) -> u32 {
        if self.converged { self.iterations } else { 0 }
    }
}

/// Solve `min ‖A·x − b‖²` subject to `x ≥ 0` for one normalized color
///
/// Starting from `x = 0`, each iteration takes a step on the free components
/// (those that are positive or whose gradient points into the orthant), then
/// projects onto `x ≥ 0` by clamping. The iteration stops once the
/// reconstructed color moves less than the tolerance, or at the cap; the last
/// iterate is returned either way.
pub fn solve_pixel(problem: &UnmixProblem, observed: [f32; 3]) -> PixelSolution {
    let a = problem.mixing.as_matrix();
    let b = Vector3::from(observed);
    let c = a.tr_mul(&b);
    let [q00, q01, q11] = problem.gram;

    let mut x = Vector2::<f32>::zeros();

    for iteration in 1..=problem.max_iterations {
        let g = Vector2::new(
            q00 * x[0] + q01 * x[1] - c[0],
            q01 * x[0] + q11 * x[1] - c[1],
        );
        let free_background = x[0] > 0.0 || g[0] < 0.0;
        let free_nuclei = x[1] > 0.0 || g[1] < 0.0;

        let step = match (free_background, free_nuclei) {
            (true, true) => problem.full_step(g),
            (true, false) => Vector2::new(axis_step(g[0], q00), 0.0),
            (false, true) => Vector2::new(0.0, axis_step(g[1], q11)),
            (false, false) => Vector2::zeros(),
        };

        let next = (x + step).map(|v| v.max(0.0));
        let change = a * (next - x);
        x = next;

        if change.norm_squared() < problem.tolerance_squared {
            return PixelSolution {
                components: [x[0], x[1]],
                iterations: iteration,
                converged: true,
            };
        }
    }

    PixelSolution {
        components: [x[0], x[1]],
        iterations: problem.max_iterations,
        converged: false,
    }
}

/// Raw per-pixel output of a backend, row-major
#[derive(Debug, Clone, Default)]
pub struct BackendOutput {
    pub components: Vec<[f32; 2]>,
    /// Per-pixel [`PixelSolution::status`]
    pub statuses: Vec<u32>,
}

/// A dense grid of non-negative (background, nuclei) intensities
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentMap {
    width: u32,
    height: u32,
    data: Vec<[f32; 2]>,
}

impl ComponentMap {
    /// Wrap row-major component data, checking its shape and sign
    pub fn from_raw(width: u32, height: u32, data: Vec<[f32; 2]>) -> Result<Self> {
        let expected = width as usize * height as usize;
        if data.len() != expected {
            return Err(invalid(format!(
                "component map of {}x{} needs {} entries, got {}",
                width,
                height,
                expected,
                data.len()
            )));
        }
        if let Some(bad) = data
            .iter()
            .flatten()
            .find(|v| !v.is_finite() || **v < 0.0)
        {
            return Err(invalid(format!(
                "component intensities must be finite and non-negative, found {}",
                bad
            )));
        }
        Ok(Self {
            width,
            height,
            data,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn get(&self, x: u32, y: u32) -> [f32; 2] {
        self.data[y as usize * self.width as usize + x as usize]
    }

    pub fn as_slice(&self) -> &[[f32; 2]] {
        &self.data
    }

    /// Fail with `InvalidParameter` unless the map covers a `width`×`height` image
    pub fn ensure_shape(&self, width: u32, height: u32) -> Result<()> {
        if (self.width, self.height) != (width, height) {
            return Err(invalid(format!(
                "component map is {}x{} but the image is {}x{}",
                self.width, self.height, width, height
            )));
        }
        Ok(())
    }

    /// Largest per-entry absolute difference, or `None` if the shapes differ
    pub fn max_difference(&self, other: &ComponentMap) -> Option<f32> {
        if self.dimensions() != other.dimensions() {
            return None;
        }
        Some(
            self.data
                .iter()
                .flatten()
                .zip(other.data.iter().flatten())
                .map(|(a, b)| (a - b).abs())
                .fold(0.0, f32::max),
        )
    }
}

/// Quality diagnostics of one unmix call
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveReport {
    pub backend: Backend,
    pub pixels: usize,
    /// Pixels that reached the iteration cap before the tolerance
    pub unconverged: usize,
    pub max_iterations_used: u32,
    /// The reference colors were nearly parallel
    pub ill_conditioned: bool,
}

impl SolveReport {
    fn summarize(
        backend: Backend,
        statuses: &[u32],
        max_iterations: u32,
        ill_conditioned: bool,
    ) -> Self {
        let unconverged = statuses.iter().filter(|&&s| s == 0).count();
        let max_iterations_used = if unconverged > 0 {
            max_iterations
        } else {
            statuses.iter().copied().max().unwrap_or(0)
        };
        Self {
            backend,
            pixels: statuses.len(),
            unconverged,
            max_iterations_used,
            ill_conditioned,
        }
    }

    pub fn converged(&self) -> bool {
        self.unconverged == 0
    }
}

/// A component map together with the diagnostics of the solve that made it
#[derive(Debug, Clone)]
pub struct UnmixResult {
    pub components: ComponentMap,
    pub report: SolveReport,
}

/// Decompose every pixel of `image` into non-negative amounts of the two
/// columns of `mixing`
///
/// Blocks until every pixel has converged or hit the iteration cap. A
/// degenerate matrix does not fail the call; it is logged and flagged in the
/// report. The GPU backend fails with `DeviceUnavailable` when no device can be
/// opened, it never falls back to the CPU on its own.
pub fn unmix(
    image: &RgbImage,
    mixing: &MixingMatrix,
    settings: &SolverSettings,
    backend: Backend,
) -> Result<UnmixResult> {
    solve_with(image, mixing, settings, backend, |problem| match backend {
        Backend::CpuTiled => Ok(tiles::solve_tiled(image, problem, settings.tile_size)),
        Backend::Gpu => solve_on_gpu(image, problem),
    })
}

/// [`unmix`] on the GPU backend with an already opened device
///
/// Lets callers that unmix repeatedly pay for device and pipeline creation
/// once.
#[cfg(feature = "gpu")]
pub fn unmix_on_gpu(
    image: &RgbImage,
    mixing: &MixingMatrix,
    settings: &SolverSettings,
    unmixer: &gpu::GpuUnmixer,
) -> Result<UnmixResult> {
    solve_with(image, mixing, settings, Backend::Gpu, |problem| {
        Ok(unmixer.solve(image, problem)?)
    })
}

/// Open a GPU unmixer, mapping a missing adapter or device to
/// `DeviceUnavailable`
#[cfg(feature = "gpu")]
pub fn open_gpu() -> Result<gpu::GpuUnmixer> {
    gpu::GpuUnmixer::new().map_err(|e| match e {
        gpu::GpuError::NoAdapter | gpu::GpuError::DeviceRequest(_) => {
            ColormapError::DeviceUnavailable(e.to_string())
        }
        other => other.into(),
    })
}

fn solve_with(
    image: &RgbImage,
    mixing: &MixingMatrix,
    settings: &SolverSettings,
    backend: Backend,
    solve: impl FnOnce(&UnmixProblem) -> Result<BackendOutput>,
) -> Result<UnmixResult> {
    settings.validate()?;

    let ill_conditioned = mixing.is_degenerate();
    if ill_conditioned {
        warn!(
            sine_squared = mixing.sine_squared(),
            "Reference colors are nearly parallel; the decomposition is unreliable"
        );
    }

    let problem = UnmixProblem::new(mixing, settings);
    let (width, height) = image.dimensions();

    let output = if width == 0 || height == 0 {
        BackendOutput::default()
    } else {
        solve(&problem)?
    };

    let report = SolveReport::summarize(
        backend,
        &output.statuses,
        settings.max_iterations,
        ill_conditioned,
    );
    if !report.converged() {
        warn!(
            unconverged = report.unconverged,
            pixels = report.pixels,
            max_iterations = settings.max_iterations,
            "Some pixels hit the iteration cap; returning their last iterate"
        );
    }
    info!(
        %backend,
        width,
        height,
        max_iterations_used = report.max_iterations_used,
        "Unmixed image"
    );

    let components = ComponentMap::from_raw(width, height, output.components)?;
    Ok(UnmixResult { components, report })
}

#[cfg(feature = "gpu")]
fn solve_on_gpu(image: &RgbImage, problem: &UnmixProblem) -> Result<BackendOutput> {
    Ok(open_gpu()?.solve(image, problem)?)
}

#[cfg(not(feature = "gpu"))]
fn solve_on_gpu(_image: &RgbImage, _problem: &UnmixProblem) -> Result<BackendOutput> {
    Err(ColormapError::DeviceUnavailable(
        "colormapper was built without the `gpu` feature".to_string(),
    ))
}

pub mod background;
pub mod color;
pub mod error;
pub mod matrix;
pub mod remix;
pub mod session;
pub mod settings;
pub mod testing;
pub mod unmix;

pub use error::{ColormapError, Result as ColormapResult};
pub use matrix::MixingMatrix;
pub use remix::{BlendMode, RemixParameters, remix, remix_for_shape};
pub use settings::Settings;
pub use unmix::{Backend, ComponentMap, SolverSettings, UnmixResult, unmix};

use anyhow::{Context, Result};
use image::RgbImage;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::Path;
use tracing::warn;

use crate::background::{detect_background_color, sample_pixel};
use crate::color::{Color, ColorSpec, format_hex_color};

/// Per-run choices that are not part of the persisted settings
#[derive(Debug, Clone, Default)]
pub struct ProcessOptions {
    /// Background reference color, resolved against the input image
    pub background: Option<ColorSpec>,
    /// Nuclei reference color, resolved against the input image
    pub nuclei: Option<ColorSpec>,
    /// Explicit remix targets; otherwise targets that matched the old
    /// reference colors follow the new ones
    pub remix_background: Option<Color>,
    pub remix_nuclei: Option<Color>,
    /// Fail on nearly parallel reference colors instead of warning
    pub strict: bool,
    /// Retry on the CPU when no GPU can be opened
    pub allow_fallback: bool,
}

/// What a run used and how the solve went
#[derive(Debug, Clone)]
pub struct ProcessSummary {
    /// The effective settings, with reference colors resolved
    pub settings: Settings,
    pub report: unmix::SolveReport,
}

/// Unmix and remix an image file, writing the result to `output_path`
pub fn process_image<P: AsRef<Path>>(
    input_path: P,
    output_path: P,
    settings: &Settings,
    options: &ProcessOptions,
) -> Result<ProcessSummary> {
    let input_path = input_path.as_ref();
    let output_path = output_path.as_ref();

    let load_progress = spinner("Loading image...")?;
    let img = image::open(input_path)
        .with_context(|| format!("Failed to open input image: {}", input_path.display()))?
        .to_rgb8();
    let (width, height) = img.dimensions();
    load_progress.finish_and_clear();
    println!(
        "✓ Loaded {} ({}x{} pixels)",
        input_path.file_name().unwrap_or_default().to_string_lossy(),
        width,
        height
    );

    let settings = resolve_settings(&img, settings, options)?;
    settings.validate()?;

    let mixing = settings.mixing_matrix();
    if options.strict {
        mixing.validate()?;
    }

    let unmix_progress = spinner(&format!("Unmixing on {}...", settings.backend))?;
    let result = unmix_with_fallback(&img, &settings, options.allow_fallback);
    unmix_progress.finish_and_clear();
    let result = result?;
    println!(
        "✓ Unmixed {} pixels on {} ({} iterations max)",
        result.report.pixels, result.report.backend, result.report.max_iterations_used
    );
    if !result.report.converged() {
        println!(
            "! {} pixels hit the iteration cap",
            result.report.unconverged
        );
    }

    let remixed = remix_for_shape(
        &result.components,
        width,
        height,
        &settings.remix_parameters(),
    )?;

    let save_progress = spinner("Saving image...")?;
    remixed
        .save(output_path)
        .with_context(|| format!("Failed to save output image: {}", output_path.display()))?;
    save_progress.finish_and_clear();
    println!(
        "✓ Saved to {}",
        output_path
            .file_name()
            .unwrap_or_default()
            .to_string_lossy()
    );

    Ok(ProcessSummary {
        settings,
        report: result.report,
    })
}

/// Unmix with the configured backend, retrying on the CPU when the GPU cannot
/// be opened and `allow_fallback` is set
pub fn unmix_with_fallback(
    img: &RgbImage,
    settings: &Settings,
    allow_fallback: bool,
) -> ColormapResult<UnmixResult> {
    let mixing = settings.mixing_matrix();
    match unmix(img, &mixing, &settings.solver, settings.backend) {
        Err(ColormapError::DeviceUnavailable(reason))
            if allow_fallback && settings.backend == Backend::Gpu =>
        {
            warn!(%reason, "GPU unavailable, falling back to the CPU backend");
            unmix(img, &mixing, &settings.solver, Backend::CpuTiled)
        }
        other => other,
    }
}

/// Apply the reference color choices of `options` to `settings`
pub fn resolve_settings(
    img: &RgbImage,
    settings: &Settings,
    options: &ProcessOptions,
) -> Result<Settings> {
    let mut resolved = *settings;

    if let Some(spec) = &options.background {
        let color = resolve_color_spec(img, spec, "background")?;
        if resolved.remix_background_color() == resolved.unmix_background_color() {
            resolved.set_remix_background_color(color);
        }
        resolved.set_unmix_background_color(color);
    }

    if let Some(spec) = &options.nuclei {
        if *spec == ColorSpec::Auto {
            anyhow::bail!("The nuclei color cannot be auto-detected; pass a hex color or @x,y");
        }
        let color = resolve_color_spec(img, spec, "nuclei")?;
        if resolved.remix_nuclei_color() == resolved.unmix_nuclei_color() {
            resolved.set_remix_nuclei_color(color);
        }
        resolved.set_unmix_nuclei_color(color);
    }

    if let Some(color) = options.remix_background {
        resolved.set_remix_background_color(color);
    }
    if let Some(color) = options.remix_nuclei {
        resolved.set_remix_nuclei_color(color);
    }

    Ok(resolved)
}

fn resolve_color_spec(img: &RgbImage, spec: &ColorSpec, name: &str) -> Result<Color> {
    let color = match *spec {
        ColorSpec::Hex(color) => return Ok(color),
        ColorSpec::Pixel(x, y) => sample_pixel(img, x, y).ok_or_else(|| {
            let (width, height) = img.dimensions();
            ColormapError::InvalidParameter(format!(
                "{} pixel @{},{} is outside the {}x{} image",
                name, x, y, width, height
            ))
        })?,
        ColorSpec::Auto => detect_background_color(img),
    };
    println!("✓ Picked {} color: {}", name, format_hex_color(color));
    Ok(color)
}

fn spinner(message: &str) -> Result<ProgressBar> {
    let progress = ProgressBar::new_spinner();
    progress.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
    progress.set_message(message.to_string());
    progress.enable_steady_tick(std::time::Duration::from_millis(100));
    Ok(progress)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn two_color_image() -> RgbImage {
        RgbImage::from_fn(20, 10, |x, _| {
            if x < 15 {
                Rgb([240, 230, 235])
            } else {
                Rgb([50, 30, 120])
            }
        })
    }

    #[test]
    fn test_resolve_auto_and_pixel_specs() {
        let img = two_color_image();
        let options = ProcessOptions {
            background: Some(ColorSpec::Auto),
            nuclei: Some(ColorSpec::Pixel(19, 5)),
            ..Default::default()
        };
        let resolved = resolve_settings(&img, &Settings::default(), &options).unwrap();

        assert_eq!(resolved.unmix_background_color(), [240, 230, 235]);
        assert_eq!(resolved.unmix_nuclei_color(), [50, 30, 120]);
        // Neutral targets follow the new references
        assert_eq!(resolved.remix_background_color(), [240, 230, 235]);
        assert_eq!(resolved.remix_nuclei_color(), [50, 30, 120]);
    }

    #[test]
    fn test_customized_targets_are_kept() {
        let img = two_color_image();
        let mut settings = Settings::default();
        settings.set_remix_nuclei_color([255, 0, 0]);
        let options = ProcessOptions {
            nuclei: Some(ColorSpec::Hex([0, 0, 255])),
            remix_background: Some([1, 2, 3]),
            ..Default::default()
        };
        let resolved = resolve_settings(&img, &settings, &options).unwrap();

        assert_eq!(resolved.unmix_nuclei_color(), [0, 0, 255]);
        assert_eq!(resolved.remix_nuclei_color(), [255, 0, 0]);
        assert_eq!(resolved.remix_background_color(), [1, 2, 3]);
    }

    #[test]
    fn test_out_of_bounds_pixel_is_rejected() {
        let img = two_color_image();
        let options = ProcessOptions {
            background: Some(ColorSpec::Pixel(20, 0)),
            ..Default::default()
        };
        assert!(resolve_settings(&img, &Settings::default(), &options).is_err());
    }

    #[test]
    fn test_nuclei_cannot_be_auto() {
        let img = two_color_image();
        let options = ProcessOptions {
            nuclei: Some(ColorSpec::Auto),
            ..Default::default()
        };
        assert!(resolve_settings(&img, &Settings::default(), &options).is_err());
    }

    #[test]
    fn test_fallback_reaches_a_result() {
        // Whether or not a GPU is present, the fallback path must produce a map
        let img = two_color_image();
        let settings = Settings::default();
        let result = unmix_with_fallback(&img, &settings, true).unwrap();
        assert_eq!(result.components.dimensions(), (20, 10));
    }

    #[test]
    fn test_cpu_backend_never_falls_back() {
        let img = two_color_image();
        let settings = Settings {
            backend: Backend::CpuTiled,
            ..Default::default()
        };
        let result = unmix_with_fallback(&img, &settings, false).unwrap();
        assert_eq!(result.report.backend, Backend::CpuTiled);
    }
}

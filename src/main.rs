use anyhow::{Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

use colormapper::{
    Backend, BlendMode, ProcessOptions, Settings,
    color::{ColorSpec, format_hex_color, parse_color_spec, parse_hex_color},
    process_image,
};

#[derive(Parser, Debug)]
#[command(
    name = "colormapper",
    about = "Separate an image into background and nuclei components and recolor them",
    version
)]
struct Args {
    /// Input image path
    input: PathBuf,

    /// Output image path (optional, defaults to input file with -colormapped suffix)
    output: Option<PathBuf>,

    /// Load a .colormapper settings file; other flags override it
    #[arg(long = "settings", value_name = "FILE")]
    settings: Option<PathBuf>,

    /// Write the effective settings to a .colormapper file after processing
    #[arg(long = "save-settings", value_name = "FILE")]
    save_settings: Option<PathBuf>,

    /// Background reference color: hex (e.g., fff, #e6c8dc), @X,Y to pick a
    /// pixel of the input, or 'auto' to detect it from the image edges
    #[arg(short = 'b', long = "bg", value_name = "SPEC")]
    background: Option<String>,

    /// Nuclei reference color: hex or @X,Y
    #[arg(short = 'n', long = "nuclei", value_name = "SPEC")]
    nuclei: Option<String>,

    /// Color the background component is remixed to (hex)
    #[arg(long = "remix-bg", value_name = "COLOR")]
    remix_background: Option<String>,

    /// Color the nuclei component is remixed to (hex)
    #[arg(long = "remix-nuclei", value_name = "COLOR")]
    remix_nuclei: Option<String>,

    /// Background intensities below this (0.0-1.0) are cut off
    #[arg(long = "bg-threshold", value_name = "FLOAT")]
    background_threshold: Option<f32>,

    #[arg(long = "bg-gain", value_name = "FLOAT")]
    background_gain: Option<f32>,

    #[arg(long = "bg-gamma", value_name = "FLOAT")]
    background_gamma: Option<f32>,

    /// Nuclei intensities below this (0.0-1.0) are cut off
    #[arg(long = "nuclei-threshold", value_name = "FLOAT")]
    nuclei_threshold: Option<f32>,

    #[arg(long = "nuclei-gain", value_name = "FLOAT")]
    nuclei_gain: Option<f32>,

    #[arg(long = "nuclei-gamma", value_name = "FLOAT")]
    nuclei_gamma: Option<f32>,

    /// How the recolored components are combined
    #[arg(short = 'm', long = "mode", value_enum)]
    mode: Option<BlendMode>,

    /// Where the per-pixel solve runs
    #[arg(long = "backend", value_enum)]
    backend: Option<Backend>,

    /// Convergence threshold in 8-bit intensity levels
    #[arg(long = "tolerance", value_name = "FLOAT")]
    tolerance: Option<f32>,

    /// Iteration cap per pixel
    #[arg(long = "max-iterations", value_name = "N")]
    max_iterations: Option<u32>,

    /// Edge length of CPU tiles in pixels
    #[arg(long = "tile-size", value_name = "N")]
    tile_size: Option<u32>,

    /// Strict mode: nearly parallel reference colors are an error instead of a warning
    #[arg(short = 's', long = "strict")]
    strict: bool,

    /// Do not retry on the CPU when no GPU is available
    #[arg(long = "no-fallback")]
    no_fallback: bool,

    /// Increase log verbosity (-v info, -vv debug); RUST_LOG takes precedence
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let output_path = determine_output_path(&args.input, args.output.as_deref())?;

    let base = match &args.settings {
        Some(path) => Settings::load(path)
            .with_context(|| format!("Failed to load settings: {}", path.display()))?,
        None => Settings::default(),
    };
    let settings = apply_overrides(base, &args);
    let options = process_options(&args)?;

    let summary = process_image(&args.input, &output_path, &settings, &options)?;

    if let Some(path) = &args.save_settings {
        summary
            .settings
            .save(path)
            .with_context(|| format!("Failed to save settings: {}", path.display()))?;
        println!(
            "✓ Saved settings to {} (background {}, nuclei {})",
            path.display(),
            format_hex_color(summary.settings.unmix_background_color()),
            format_hex_color(summary.settings.unmix_nuclei_color())
        );
    }

    Ok(())
}

/// Log to stderr; `RUST_LOG` wins over `-v`
fn init_logging(verbose: u8) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(base_log_level(verbose)));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

fn base_log_level(verbose: u8) -> &'static str {
    match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    }
}

/// Layer explicit command line values over the loaded settings
fn apply_overrides(mut settings: Settings, args: &Args) -> Settings {
    if let Some(v) = args.background_threshold {
        settings.set_remix_background_threshold(v);
    }
    if let Some(v) = args.background_gain {
        settings.set_remix_background_gain(v);
    }
    if let Some(v) = args.background_gamma {
        settings.set_remix_background_gamma(v);
    }
    if let Some(v) = args.nuclei_threshold {
        settings.set_remix_nuclei_threshold(v);
    }
    if let Some(v) = args.nuclei_gain {
        settings.set_remix_nuclei_gain(v);
    }
    if let Some(v) = args.nuclei_gamma {
        settings.set_remix_nuclei_gamma(v);
    }
    if let Some(mode) = args.mode {
        settings.set_remix_mode(mode);
    }
    if let Some(backend) = args.backend {
        settings.backend = backend;
    }
    if let Some(tolerance) = args.tolerance {
        settings.solver.tolerance = tolerance;
    }
    if let Some(max_iterations) = args.max_iterations {
        settings.solver.max_iterations = max_iterations;
    }
    if let Some(tile_size) = args.tile_size {
        settings.solver.tile_size = tile_size;
    }
    settings
}

fn process_options(args: &Args) -> Result<ProcessOptions> {
    let background = args
        .background
        .as_deref()
        .map(parse_color_spec)
        .transpose()
        .context("Invalid background color")?;
    let nuclei = args
        .nuclei
        .as_deref()
        .map(parse_color_spec)
        .transpose()
        .context("Invalid nuclei color")?;
    if nuclei == Some(ColorSpec::Auto) {
        anyhow::bail!("The nuclei color cannot be 'auto'; pass a hex color or @X,Y");
    }

    let remix_background = args
        .remix_background
        .as_deref()
        .map(parse_hex_color)
        .transpose()
        .context("Invalid background remix color")?;
    let remix_nuclei = args
        .remix_nuclei
        .as_deref()
        .map(parse_hex_color)
        .transpose()
        .context("Invalid nuclei remix color")?;

    Ok(ProcessOptions {
        background,
        nuclei,
        remix_background,
        remix_nuclei,
        strict: args.strict,
        allow_fallback: !args.no_fallback,
    })
}

/// Determine the output path for the processed image
///
/// If output is provided, use it as-is.
/// If output is None, generate a filename based on the input with a -colormapped suffix.
/// If that file already exists, append -1, -2, etc. until we find an available filename.
fn determine_output_path(input: &Path, output: Option<&Path>) -> Result<PathBuf> {
    if let Some(output) = output {
        return Ok(output.to_path_buf());
    }

    let input_stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .context("Invalid input filename")?;

    let input_ext = input.extension().and_then(|s| s.to_str()).unwrap_or("png");

    let parent = input.parent().unwrap_or_else(|| Path::new("."));

    let base_output = parent.join(format!("{}-colormapped.{}", input_stem, input_ext));
    if !base_output.exists() {
        return Ok(base_output);
    }

    for i in 1..1000 {
        let numbered_output =
            parent.join(format!("{}-colormapped-{}.{}", input_stem, i, input_ext));
        if !numbered_output.exists() {
            return Ok(numbered_output);
        }
    }

    anyhow::bail!("Could not generate unique output filename (tried up to -colormapped-999)")
}

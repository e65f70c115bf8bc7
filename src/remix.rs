//! Recompose an image from component intensities.
//!
//! Each component intensity goes through a fixed tone curve, in this order:
//!
//! 1. threshold `t`: `max(0, (x − t) / (1 − t))`; `t = 0` is a no-op and
//!    `t = 1` suppresses the component entirely
//! 2. gain: multiply
//! 3. gamma: `value^γ`
//!
//! and is then scaled by its target color. The two contributions are combined
//! by the [`BlendMode`] and clamped to the output range.

use std::str::FromStr;

use clap::ValueEnum;
use image::{Rgb, RgbImage};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::color::{Color, NormalizedColor, denormalize_color};
use crate::error::{ColormapError, Result, invalid};
use crate::matrix::{BACKGROUND, MixingMatrix, NUCLEI};
use crate::unmix::ComponentMap;

/// How the two per-component contributions are combined
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum BlendMode {
    /// Linear sum; the identity when targets equal the reference colors
    #[default]
    Add,
    /// `1 − (1 − c₀)(1 − c₁)`
    Screen,
    /// Nuclei laid over the background, weighted by the nuclei intensity
    Overwrite,
}

impl FromStr for BlendMode {
    type Err = ColormapError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "add" => Ok(BlendMode::Add),
            "screen" => Ok(BlendMode::Screen),
            "overwrite" => Ok(BlendMode::Overwrite),
            other => Err(invalid(format!("unrecognized blend mode '{}'", other))),
        }
    }
}

impl BlendMode {
    /// Combine background and nuclei contributions. `nuclei_weight` is the
    /// nuclei intensity after its tone curve.
    fn combine(self, background: [f32; 3], nuclei: [f32; 3], nuclei_weight: f32) -> [f32; 3] {
        match self {
            BlendMode::Add => std::array::from_fn(|i| background[i] + nuclei[i]),
            BlendMode::Screen => std::array::from_fn(|i| {
                let b = background[i].clamp(0.0, 1.0);
                let n = nuclei[i].clamp(0.0, 1.0);
                1.0 - (1.0 - b) * (1.0 - n)
            }),
            BlendMode::Overwrite => {
                let w = nuclei_weight.clamp(0.0, 1.0);
                std::array::from_fn(|i| (1.0 - w) * background[i] + nuclei[i])
            }
        }
    }
}

/// Tone curve and target color of one component
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ComponentRemix {
    pub target: Color,
    pub threshold: f32,
    pub gain: f32,
    pub gamma: f32,
}

impl ComponentRemix {
    /// Identity curve towards `target`
    pub fn neutral(target: Color) -> Self {
        Self {
            target,
            threshold: 0.0,
            gain: 1.0,
            gamma: 1.0,
        }
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if !(0.0..=1.0).contains(&self.threshold) {
            return Err(invalid(format!(
                "{} threshold must be between 0 and 1, got {}",
                name, self.threshold
            )));
        }
        if !self.gain.is_finite() || self.gain < 0.0 {
            return Err(invalid(format!(
                "{} gain must be non-negative, got {}",
                name, self.gain
            )));
        }
        if !self.gamma.is_finite() || self.gamma <= 0.0 {
            return Err(invalid(format!(
                "{} gamma must be positive, got {}",
                name, self.gamma
            )));
        }
        Ok(())
    }

    /// Apply threshold, gain, then gamma to a component intensity
    pub fn tone(&self, intensity: f32) -> f32 {
        let thresholded = apply_threshold(intensity, self.threshold);
        let gained = thresholded * self.gain;
        if gained <= 0.0 {
            0.0
        } else {
            gained.powf(self.gamma)
        }
    }
}

/// Rescale so that `threshold` maps to 0 and 1 stays 1
pub fn apply_threshold(intensity: f32, threshold: f32) -> f32 {
    if threshold <= 0.0 {
        intensity
    } else if threshold >= 1.0 {
        0.0
    } else {
        ((intensity - threshold) / (1.0 - threshold)).max(0.0)
    }
}

/// Everything the compositor needs besides the component map
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemixParameters {
    pub background: ComponentRemix,
    pub nuclei: ComponentRemix,
    pub mode: BlendMode,
}

impl RemixParameters {
    /// Neutral curves with targets equal to the reference colors; remixing an
    /// unmixed image with these reproduces it
    pub fn neutral(background: Color, nuclei: Color) -> Self {
        Self {
            background: ComponentRemix::neutral(background),
            nuclei: ComponentRemix::neutral(nuclei),
            mode: BlendMode::Add,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.background.validate("background")?;
        self.nuclei.validate("nuclei")
    }

    /// The target matrix `B`
    pub fn targets(&self) -> MixingMatrix {
        MixingMatrix::from_colors(self.background.target, self.nuclei.target)
    }

    /// Remix one pixel's components into a normalized color
    pub fn remix_pixel(&self, components: [f32; 2]) -> NormalizedColor {
        self.remix_with_targets(self.target_columns(), components)
    }

    fn target_columns(&self) -> [NormalizedColor; 2] {
        let targets = self.targets();
        [targets.column(BACKGROUND), targets.column(NUCLEI)]
    }

    fn remix_with_targets(
        &self,
        [background_target, nuclei_target]: [NormalizedColor; 2],
        components: [f32; 2],
    ) -> NormalizedColor {
        let y0 = self.background.tone(components[0]);
        let y1 = self.nuclei.tone(components[1]);

        let background = background_target.map(|c| y0 * c);
        let nuclei = nuclei_target.map(|c| y1 * c);

        self.mode
            .combine(background, nuclei, y1)
            .map(|c| c.clamp(0.0, 1.0))
    }
}

/// Recompose an image from a component map
///
/// Pure: identical inputs always produce byte-identical output. Parameters are
/// validated before the output is allocated.
pub fn remix(components: &ComponentMap, params: &RemixParameters) -> Result<RgbImage> {
    params.validate()?;

    let (width, height) = components.dimensions();
    let mut output = RgbImage::new(width, height);
    if width == 0 || height == 0 {
        return Ok(output);
    }

    let targets = params.target_columns();
    output
        .par_chunks_mut(width as usize * 3)
        .zip(components.as_slice().par_chunks(width as usize))
        .for_each(|(out_row, in_row)| {
            for (out, &x) in out_row.chunks_exact_mut(3).zip(in_row) {
                let color = params.remix_with_targets(targets, x);
                out.copy_from_slice(&denormalize_color(color));
            }
        });

    Ok(output)
}

/// [`remix`] after checking that the map was made from a `width`×`height` image
pub fn remix_for_shape(
    components: &ComponentMap,
    width: u32,
    height: u32,
    params: &RemixParameters,
) -> Result<RgbImage> {
    components.ensure_shape(width, height)?;
    remix(components, params)
}

/// Remix a single pixel to 8-bit RGB
pub fn remix_color(components: [f32; 2], params: &RemixParameters) -> Rgb<u8> {
    Rgb(denormalize_color(params.remix_pixel(components)))
}

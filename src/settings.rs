//! Persisted `.colormapper` settings: reference colors, remix curves, and
//! solver configuration, stored as pretty-printed JSON.

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::color::Color;
use crate::error::Result;
use crate::matrix::MixingMatrix;
use crate::remix::{BlendMode, ComponentRemix, RemixParameters};
use crate::unmix::{Backend, SolverSettings};

/// Stain-like default background reference color
pub const DEFAULT_BACKGROUND_COLOR: Color = [230, 200, 220];

/// Stain-like default nuclei reference color
pub const DEFAULT_NUCLEI_COLOR: Color = [60, 40, 140];

/// Reference colors the image is decomposed into
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnmixSettings {
    pub background_color: Color,
    pub nuclei_color: Color,
}

impl Default for UnmixSettings {
    fn default() -> Self {
        Self {
            background_color: DEFAULT_BACKGROUND_COLOR,
            nuclei_color: DEFAULT_NUCLEI_COLOR,
        }
    }
}

/// Tone curve and target color of one component
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentSettings {
    pub color: Color,
    pub threshold: f32,
    pub gain: f32,
    pub gamma: f32,
}

impl ComponentSettings {
    fn neutral(color: Color) -> Self {
        Self {
            color,
            threshold: 0.0,
            gain: 1.0,
            gamma: 1.0,
        }
    }
}

impl Default for ComponentSettings {
    fn default() -> Self {
        Self::neutral([0, 0, 0])
    }
}

impl From<ComponentSettings> for ComponentRemix {
    fn from(settings: ComponentSettings) -> Self {
        ComponentRemix {
            target: settings.color,
            threshold: settings.threshold,
            gain: settings.gain,
            gamma: settings.gamma,
        }
    }
}

/// How the components are recomposed
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemixSettings {
    pub background: ComponentSettings,
    pub nuclei: ComponentSettings,
    pub mode: BlendMode,
}

impl Default for RemixSettings {
    fn default() -> Self {
        Self {
            background: ComponentSettings::neutral(DEFAULT_BACKGROUND_COLOR),
            nuclei: ComponentSettings::neutral(DEFAULT_NUCLEI_COLOR),
            mode: BlendMode::Add,
        }
    }
}

/// Everything a `.colormapper` file stores
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub unmix: UnmixSettings,
    pub remix: RemixSettings,
    pub solver: SolverSettings,
    pub backend: Backend,
}

impl Settings {
    /// Read settings from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let settings = serde_json::from_str(&contents)?;
        debug!(path = %path.display(), "Loaded settings");
        Ok(settings)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        debug!(path = %path.display(), "Saved settings");
        Ok(())
    }

    /// Validate everything that `unmix` and `remix` would reject
    pub fn validate(&self) -> Result<()> {
        self.solver.validate()?;
        self.remix_parameters().validate()
    }

    /// Matrix `A` with the background and nuclei reference colors as columns
    pub fn mixing_matrix(&self) -> MixingMatrix {
        MixingMatrix::from_colors(self.unmix.background_color, self.unmix.nuclei_color)
    }

    pub fn remix_parameters(&self) -> RemixParameters {
        RemixParameters {
            background: self.remix.background.into(),
            nuclei: self.remix.nuclei.into(),
            mode: self.remix.mode,
        }
    }

    pub fn unmix_background_color(&self) -> Color {
        self.unmix.background_color
    }

    pub fn set_unmix_background_color(&mut self, color: Color) {
        self.unmix.background_color = color;
    }

    pub fn unmix_nuclei_color(&self) -> Color {
        self.unmix.nuclei_color
    }

    pub fn set_unmix_nuclei_color(&mut self, color: Color) {
        self.unmix.nuclei_color = color;
    }

    pub fn remix_background_color(&self) -> Color {
        self.remix.background.color
    }

    pub fn set_remix_background_color(&mut self, color: Color) {
        self.remix.background.color = color;
    }

    pub fn remix_nuclei_color(&self) -> Color {
        self.remix.nuclei.color
    }

    pub fn set_remix_nuclei_color(&mut self, color: Color) {
        self.remix.nuclei.color = color;
    }

    pub fn remix_background_threshold(&self) -> f32 {
        self.remix.background.threshold
    }

    pub fn set_remix_background_threshold(&mut self, threshold: f32) {
        self.remix.background.threshold = threshold;
    }

    pub fn remix_nuclei_threshold(&self) -> f32 {
        self.remix.nuclei.threshold
    }

    pub fn set_remix_nuclei_threshold(&mut self, threshold: f32) {
        self.remix.nuclei.threshold = threshold;
    }

    pub fn remix_background_gain(&self) -> f32 {
        self.remix.background.gain
    }

    pub fn set_remix_background_gain(&mut self, gain: f32) {
        self.remix.background.gain = gain;
    }

    pub fn remix_nuclei_gain(&self) -> f32 {
        self.remix.nuclei.gain
    }

    pub fn set_remix_nuclei_gain(&mut self, gain: f32) {
        self.remix.nuclei.gain = gain;
    }

    pub fn remix_background_gamma(&self) -> f32 {
        self.remix.background.gamma
    }

    pub fn set_remix_background_gamma(&mut self, gamma: f32) {
        self.remix.background.gamma = gamma;
    }

    pub fn remix_nuclei_gamma(&self) -> f32 {
        self.remix.nuclei.gamma
    }

    pub fn set_remix_nuclei_gamma(&mut self, gamma: f32) {
        self.remix.nuclei.gamma = gamma;
    }

    pub fn remix_mode(&self) -> BlendMode {
        self.remix.mode
    }

    pub fn set_remix_mode(&mut self, mode: BlendMode) {
        self.remix.mode = mode;
    }
}

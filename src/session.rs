//! An image being colormapped interactively.
//!
//! Unmixing is the expensive step, so its result is cached and only recomputed
//! after a change that affects it: a new image, new reference colors, or new
//! solver settings. Remix changes reuse the cached components. The GPU device
//! is opened on first use and kept for the life of the session.

use image::RgbImage;
use tracing::debug;

use crate::color::Color;
use crate::error::Result;
use crate::remix::remix_for_shape;
use crate::settings::{RemixSettings, Settings};
#[cfg(feature = "gpu")]
use crate::unmix::{gpu::GpuUnmixer, open_gpu, unmix_on_gpu};
use crate::unmix::{Backend, SolverSettings, UnmixResult, unmix};

pub struct Session {
    image: RgbImage,
    settings: Settings,
    unmixed: Option<UnmixResult>,
    unmix_count: usize,
    #[cfg(feature = "gpu")]
    gpu: Option<GpuUnmixer>,
}

impl Session {
    pub fn new(image: RgbImage, settings: Settings) -> Self {
        Self {
            image,
            settings,
            unmixed: None,
            unmix_count: 0,
            #[cfg(feature = "gpu")]
            gpu: None,
        }
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Replace the input image
    pub fn set_image(&mut self, image: RgbImage) {
        self.image = image;
        self.invalidate();
    }

    /// Replace every setting; the cached unmix survives if the unmix inputs
    /// are unchanged
    pub fn set_settings(&mut self, settings: Settings) {
        let unmix_changed = settings.unmix != self.settings.unmix
            || settings.solver != self.settings.solver
            || settings.backend != self.settings.backend;
        self.settings = settings;
        if unmix_changed {
            self.invalidate();
        }
    }

    pub fn set_unmix_background_color(&mut self, color: Color) {
        if color != self.settings.unmix_background_color() {
            self.settings.set_unmix_background_color(color);
            self.invalidate();
        }
    }

    pub fn set_unmix_nuclei_color(&mut self, color: Color) {
        if color != self.settings.unmix_nuclei_color() {
            self.settings.set_unmix_nuclei_color(color);
            self.invalidate();
        }
    }

    pub fn set_solver(&mut self, solver: SolverSettings) {
        if solver != self.settings.solver {
            self.settings.solver = solver;
            self.invalidate();
        }
    }

    pub fn set_backend(&mut self, backend: Backend) {
        if backend != self.settings.backend {
            self.settings.backend = backend;
            self.invalidate();
        }
    }

    /// Remix settings can change freely without re-unmixing
    pub fn remix_settings_mut(&mut self) -> &mut RemixSettings {
        &mut self.settings.remix
    }

    /// Whether the next [`output`](Self::output) has to unmix again
    pub fn is_stale(&self) -> bool {
        self.unmixed.is_none()
    }

    /// How many times the image has been unmixed
    pub fn unmix_count(&self) -> usize {
        self.unmix_count
    }

    /// The cached decomposition, computing it first if stale
    pub fn unmixed(&mut self) -> Result<&UnmixResult> {
        let result = match self.unmixed.take() {
            Some(result) => result,
            None => {
                let result = self.run_unmix()?;
                self.unmix_count += 1;
                debug!(unmix_count = self.unmix_count, "Refreshed cached unmix");
                result
            }
        };
        Ok(self.unmixed.insert(result))
    }

    /// The remixed image for the current settings
    pub fn output(&mut self) -> Result<RgbImage> {
        let params = self.settings.remix_parameters();
        params.validate()?;
        let (width, height) = self.image.dimensions();
        let result = self.unmixed()?;
        remix_for_shape(&result.components, width, height, &params)
    }

    #[cfg(feature = "gpu")]
    fn run_unmix(&mut self) -> Result<UnmixResult> {
        let (width, height) = self.image.dimensions();
        if self.settings.backend != Backend::Gpu || width == 0 || height == 0 {
            return self.run_unmix_stateless();
        }

        let unmixer = match self.gpu.take() {
            Some(unmixer) => unmixer,
            None => {
                debug!("Opening GPU device for session");
                open_gpu()?
            }
        };
        let unmixer = self.gpu.insert(unmixer);
        unmix_on_gpu(
            &self.image,
            &self.settings.mixing_matrix(),
            &self.settings.solver,
            unmixer,
        )
    }

    #[cfg(not(feature = "gpu"))]
    fn run_unmix(&mut self) -> Result<UnmixResult> {
        self.run_unmix_stateless()
    }

    fn run_unmix_stateless(&self) -> Result<UnmixResult> {
        unmix(
            &self.image,
            &self.settings.mixing_matrix(),
            &self.settings.solver,
            self.settings.backend,
        )
    }

    fn invalidate(&mut self) {
        self.unmixed = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remix::BlendMode;
    use image::Rgb;

    fn cpu_settings() -> Settings {
        Settings {
            backend: Backend::CpuTiled,
            ..Default::default()
        }
    }

    fn stain_image() -> RgbImage {
        let settings = Settings::default();
        RgbImage::from_fn(6, 4, |x, _| {
            if x < 3 {
                Rgb(settings.unmix_background_color())
            } else {
                Rgb(settings.unmix_nuclei_color())
            }
        })
    }

    #[test]
    fn test_neutral_output_reproduces_input() {
        let mut session = Session::new(stain_image(), cpu_settings());
        let output = session.output().unwrap();
        assert_eq!(output.as_raw(), session.image().as_raw());
    }

    #[test]
    fn test_remix_changes_reuse_cached_unmix() {
        let mut session = Session::new(stain_image(), cpu_settings());
        assert!(session.is_stale());
        session.output().unwrap();
        assert_eq!(session.unmix_count(), 1);

        session.remix_settings_mut().nuclei.color = [255, 0, 0];
        session.remix_settings_mut().mode = BlendMode::Screen;
        let output = session.output().unwrap();
        assert_eq!(session.unmix_count(), 1);
        assert_eq!(output.get_pixel(5, 0), &Rgb([255, 0, 0]));

        let mut settings = *session.settings();
        settings.remix.background.gamma = 2.0;
        session.set_settings(settings);
        session.output().unwrap();
        assert_eq!(session.unmix_count(), 1);
    }

    #[test]
    fn test_unmix_changes_invalidate() {
        let mut session = Session::new(stain_image(), cpu_settings());
        session.output().unwrap();

        session.set_unmix_nuclei_color([0, 0, 255]);
        assert!(session.is_stale());
        session.output().unwrap();
        assert_eq!(session.unmix_count(), 2);

        session.set_solver(SolverSettings {
            max_iterations: 10,
            ..Default::default()
        });
        session.output().unwrap();
        assert_eq!(session.unmix_count(), 3);

        session.set_image(RgbImage::new(2, 2));
        let output = session.output().unwrap();
        assert_eq!(session.unmix_count(), 4);
        assert_eq!(output.dimensions(), (2, 2));
    }

    #[test]
    fn test_setting_the_same_color_keeps_cache() {
        let mut session = Session::new(stain_image(), cpu_settings());
        session.output().unwrap();
        let current = session.settings().unmix_background_color();
        session.set_unmix_background_color(current);
        session.set_backend(Backend::CpuTiled);
        assert!(!session.is_stale());
    }

    #[cfg(feature = "gpu")]
    #[test]
    fn test_gpu_device_survives_invalidation() {
        use crate::testing::max_channel_difference;

        if !crate::unmix::gpu::is_gpu_available() {
            return;
        }

        let mut session = Session::new(stain_image(), Settings::default());
        assert!(session.gpu.is_none());
        let first = session.output().unwrap();
        assert!(max_channel_difference(session.image(), &first).unwrap() <= 1);
        assert!(session.gpu.is_some());

        session.set_unmix_nuclei_color([0, 0, 255]);
        assert!(session.is_stale());
        assert!(session.gpu.is_some());
        session.output().unwrap();
        assert_eq!(session.unmix_count(), 2);
        assert_eq!(session.unmixed().unwrap().report.backend, Backend::Gpu);

        session.set_backend(Backend::CpuTiled);
        session.output().unwrap();
        assert_eq!(session.unmix_count(), 3);
        assert_eq!(session.unmixed().unwrap().report.backend, Backend::CpuTiled);
        assert!(session.gpu.is_some());
    }

    #[test]
    fn test_cpu_session_never_opens_device() {
        let mut session = Session::new(stain_image(), cpu_settings());
        session.output().unwrap();
        session.set_unmix_background_color([250, 250, 250]);
        session.output().unwrap();
        assert_eq!(session.unmix_count(), 2);
        #[cfg(feature = "gpu")]
        assert!(session.gpu.is_none());
    }

    #[test]
    fn test_invalid_remix_fails_without_unmixing() {
        let mut session = Session::new(stain_image(), cpu_settings());
        session.remix_settings_mut().nuclei.gamma = -1.0;
        assert!(session.output().is_err());
        assert_eq!(session.unmix_count(), 0);
    }
}

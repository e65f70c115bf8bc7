use crate::color::Color;
use image::RgbImage;
use std::collections::HashMap;

/// Configuration for background detection
pub struct BackgroundDetectionConfig {
    /// Sample every N pixels on edges
    pub edge_sample_interval: u32,
}

impl Default for BackgroundDetectionConfig {
    fn default() -> Self {
        Self {
            edge_sample_interval: 10,
        }
    }
}

/// Detect the background color by sampling image edges and corners
///
/// Slides usually show bare background around the tissue, so the most common
/// edge color is a good background reference. Returns black for an empty image.
pub fn detect_background_color(img: &RgbImage) -> Color {
    detect_background_color_with_config(img, &BackgroundDetectionConfig::default())
}

/// Detect background color with custom configuration
pub fn detect_background_color_with_config(
    img: &RgbImage,
    config: &BackgroundDetectionConfig,
) -> Color {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return [0, 0, 0];
    }
    let step = config.edge_sample_interval.max(1) as usize;

    let mut sample_points = vec![
        (0, 0),
        (width - 1, 0),
        (0, height - 1),
        (width - 1, height - 1),
    ];

    for x in (0..width).step_by(step) {
        sample_points.push((x, 0));
        sample_points.push((x, height - 1));
    }

    for y in (0..height).step_by(step) {
        sample_points.push((0, y));
        sample_points.push((width - 1, y));
    }

    let mut color_counts: HashMap<Color, u32> = HashMap::new();
    for &(x, y) in &sample_points {
        *color_counts.entry(img.get_pixel(x, y).0).or_insert(0) += 1;
    }

    // Ties go to the smallest color so the result does not depend on hash order
    color_counts
        .into_iter()
        .max_by(|(color_a, count_a), (color_b, count_b)| {
            count_a.cmp(count_b).then_with(|| color_b.cmp(color_a))
        })
        .map(|(color, _)| color)
        .unwrap_or([0, 0, 0])
}

/// The color at (x, y), or `None` outside the image
pub fn sample_pixel(img: &RgbImage, x: u32, y: u32) -> Option<Color> {
    img.get_pixel_checked(x, y).map(|pixel| pixel.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_detect_uniform_background() {
        let img = RgbImage::from_pixel(100, 100, Rgb([230, 200, 220]));
        assert_eq!(detect_background_color(&img), [230, 200, 220]);
    }

    #[test]
    fn test_detect_background_with_center_object() {
        let img = RgbImage::from_fn(100, 100, |x, y| {
            if x > 25 && x < 75 && y > 25 && y < 75 {
                Rgb([60, 40, 140])
            } else {
                Rgb([255, 255, 255])
            }
        });

        assert_eq!(detect_background_color(&img), [255, 255, 255]);
    }

    #[test]
    fn test_custom_config() {
        let img = RgbImage::from_pixel(100, 100, Rgb([128, 128, 128]));

        let config = BackgroundDetectionConfig {
            edge_sample_interval: 5,
        };

        let detected = detect_background_color_with_config(&img, &config);
        assert_eq!(detected, [128, 128, 128]);
    }

    #[test]
    fn test_single_pixel_and_empty_images() {
        let img = RgbImage::from_pixel(1, 1, Rgb([9, 8, 7]));
        assert_eq!(detect_background_color(&img), [9, 8, 7]);
        assert_eq!(detect_background_color(&RgbImage::new(0, 0)), [0, 0, 0]);
    }

    #[test]
    fn test_sample_pixel() {
        let img = RgbImage::from_fn(4, 3, |x, y| Rgb([x as u8, y as u8, 0]));
        assert_eq!(sample_pixel(&img, 3, 2), Some([3, 2, 0]));
        assert_eq!(sample_pixel(&img, 4, 0), None);
        assert_eq!(sample_pixel(&img, 0, 3), None);
    }
}

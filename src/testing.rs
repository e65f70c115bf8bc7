//! Helpers for building synthetic inputs and measuring reconstruction quality.

use image::{Rgb, RgbImage};

use crate::color::{Color, denormalize_color, normalize_color};

/// Build an image whose pixel (x, y) is `amounts(x, y).0 · background +
/// amounts(x, y).1 · nuclei`, rounded to 8 bits
pub fn synthesize_mixture<F>(
    width: u32,
    height: u32,
    background: Color,
    nuclei: Color,
    amounts: F,
) -> RgbImage
where
    F: Fn(u32, u32) -> (f32, f32),
{
    let a = normalize_color(background);
    let n = normalize_color(nuclei);
    RgbImage::from_fn(width, height, |x, y| {
        let (x0, x1) = amounts(x, y);
        Rgb(denormalize_color([
            x0 * a[0] + x1 * n[0],
            x0 * a[1] + x1 * n[1],
            x0 * a[2] + x1 * n[2],
        ]))
    })
}

/// Background amount falls left to right, nuclei amount rises top to bottom.
/// Every pixel is inside the cone spanned by the two colors.
pub fn gradient_mixture(width: u32, height: u32, background: Color, nuclei: Color) -> RgbImage {
    let wx = width.saturating_sub(1).max(1) as f32;
    let hy = height.saturating_sub(1).max(1) as f32;
    synthesize_mixture(width, height, background, nuclei, |x, y| {
        (0.5 * (1.0 - x as f32 / wx), 0.5 * (y as f32 / hy))
    })
}

/// Largest absolute per-channel difference; `None` if the sizes differ
pub fn max_channel_difference(img1: &RgbImage, img2: &RgbImage) -> Option<u8> {
    if img1.dimensions() != img2.dimensions() {
        return None;
    }
    Some(
        img1.as_raw()
            .iter()
            .zip(img2.as_raw())
            .map(|(a, b)| a.abs_diff(*b))
            .max()
            .unwrap_or(0),
    )
}

/// Peak signal-to-noise ratio in dB, infinite for identical images
pub fn calculate_psnr(img1: &RgbImage, img2: &RgbImage) -> f64 {
    let mut sum_squared_diff = 0.0;
    let mut sample_count = 0usize;

    for (a, b) in img1.as_raw().iter().zip(img2.as_raw()) {
        let diff = *a as f64 - *b as f64;
        sum_squared_diff += diff * diff;
        sample_count += 1;
    }

    if sample_count == 0 || sum_squared_diff == 0.0 {
        return f64::INFINITY;
    }

    let mse = sum_squared_diff / sample_count as f64;
    20.0 * (255.0 / mse.sqrt()).log10()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthesize_pure_colors() {
        let img = synthesize_mixture(2, 1, [230, 200, 220], [60, 40, 140], |x, _| {
            if x == 0 { (1.0, 0.0) } else { (0.0, 1.0) }
        });
        assert_eq!(img.get_pixel(0, 0), &Rgb([230, 200, 220]));
        assert_eq!(img.get_pixel(1, 0), &Rgb([60, 40, 140]));
    }

    #[test]
    fn test_gradient_corners() {
        let img = gradient_mixture(5, 5, [200, 200, 200], [0, 0, 200]);
        assert_eq!(img.get_pixel(0, 0), &Rgb([100, 100, 100]));
        assert_eq!(img.get_pixel(4, 0), &Rgb([0, 0, 0]));
        assert_eq!(img.get_pixel(4, 4), &Rgb([0, 0, 100]));
    }

    #[test]
    fn test_psnr_and_difference() {
        let a = RgbImage::from_pixel(4, 4, Rgb([100, 100, 100]));
        let mut b = a.clone();
        assert_eq!(calculate_psnr(&a, &b), f64::INFINITY);
        assert_eq!(max_channel_difference(&a, &b), Some(0));

        b.put_pixel(0, 0, Rgb([110, 100, 100]));
        assert_eq!(max_channel_difference(&a, &b), Some(10));
        assert!(calculate_psnr(&a, &b) > 30.0);
        assert!(calculate_psnr(&a, &b).is_finite());

        assert_eq!(max_channel_difference(&a, &RgbImage::new(2, 2)), None);
    }
}

#![allow(dead_code)]

use colormapper::color::Color;
use image::RgbImage;
use std::fs;
use std::path::Path;

// Set to true to save test outputs for inspection
pub const SAVE_TEST_OUTPUTS: bool = false;

pub const BACKGROUND: Color = [230, 200, 220];
pub const NUCLEI: Color = [60, 40, 140];

pub fn save_test_image(test_name: &str, image: &RgbImage) {
    if SAVE_TEST_OUTPUTS {
        fs::create_dir_all("tests/outputs").unwrap();
        let path = format!("tests/outputs/{}.png", test_name);
        image.save(&path).unwrap();
        println!("  Saved: {}", path);
    }
}

/// Write a PNG into a scratch directory and return its path
pub fn write_png(dir: &Path, name: &str, image: &RgbImage) -> std::path::PathBuf {
    let path = dir.join(name);
    image.save(&path).unwrap();
    path
}

/// Compare two images using image-compare's hybrid comparison
///
/// Returns a score between 0.0 and 1.0 where 1.0 is identical
pub fn compare_images(img1: &RgbImage, img2: &RgbImage) -> Result<f64, String> {
    match image_compare::rgb_hybrid_compare(img1, img2) {
        Ok(result) => Ok(result.score),
        Err(_) => Err("Images must have same dimensions".to_string()),
    }
}

/// Calculate similarity percentage (0-100%) between two images
pub fn calculate_similarity_percentage(img1: &RgbImage, img2: &RgbImage) -> f64 {
    match compare_images(img1, img2) {
        Ok(score) => score * 100.0,
        Err(_) => 0.0,
    }
}

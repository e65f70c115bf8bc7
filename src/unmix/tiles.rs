use image::RgbImage;
use rayon::prelude::*;
use tracing::debug;

use super::{BackendOutput, PixelSolution, UnmixProblem, solve_pixel};
use crate::color::normalize_color;

/// A rectangular region of the image solved as one parallel work item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tile {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Tile {
    /// Cover a `width`×`height` image with non-overlapping tiles, row by row.
    /// Tiles on the right and bottom edges are clipped to the image.
    pub fn grid(width: u32, height: u32, tile_size: u32) -> Vec<Tile> {
        let tile_size = tile_size.max(1);
        (0..height)
            .step_by(tile_size as usize)
            .flat_map(|y| {
                (0..width).step_by(tile_size as usize).map(move |x| Tile {
                    x,
                    y,
                    width: tile_size.min(width - x),
                    height: tile_size.min(height - y),
                })
            })
            .collect()
    }

    pub fn pixel_count(&self) -> usize {
        self.width as usize * self.height as usize
    }
}

/// Solve every pixel of a tile, row-major within the tile
fn solve_tile(image: &RgbImage, problem: &UnmixProblem, tile: Tile) -> Vec<PixelSolution> {
    let mut solutions = Vec::with_capacity(tile.pixel_count());
    for y in tile.y..tile.y + tile.height {
        for x in tile.x..tile.x + tile.width {
            let observed = normalize_color(image.get_pixel(x, y).0);
            solutions.push(solve_pixel(problem, observed));
        }
    }
    solutions
}

/// CPU backend: solve tiles in parallel, each into its own buffer, then stitch
/// the buffers into the row-major output
pub fn solve_tiled(image: &RgbImage, problem: &UnmixProblem, tile_size: u32) -> BackendOutput {
    let (width, height) = image.dimensions();
    let tiles = Tile::grid(width, height, tile_size);
    debug!(tiles = tiles.len(), tile_size, "Solving tiles on the CPU");

    let solved: Vec<(Tile, Vec<PixelSolution>)> = tiles
        .par_iter()
        .map(|&tile| (tile, solve_tile(image, problem, tile)))
        .collect();

    let pixel_count = width as usize * height as usize;
    let mut output = BackendOutput {
        components: vec![[0.0; 2]; pixel_count],
        statuses: vec![0; pixel_count],
    };

    for (tile, solutions) in solved {
        for (row, chunk) in solutions.chunks(tile.width as usize).enumerate() {
            let start = (tile.y as usize + row) * width as usize + tile.x as usize;
            for (offset, solution) in chunk.iter().enumerate() {
                output.components[start + offset] = solution.components;
                output.statuses[start + offset] = solution.status();
            }
        }
    }

    output
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matrix::MixingMatrix;
    use crate::unmix::SolverSettings;
    use image::Rgb;

    #[test]
    fn test_grid_covers_image_without_overlap() {
        let tiles = Tile::grid(10, 7, 4);
        assert_eq!(tiles.len(), 3 * 2);
        assert_eq!(tiles.iter().map(Tile::pixel_count).sum::<usize>(), 70);

        let mut covered = vec![0u8; 70];
        for tile in &tiles {
            for y in tile.y..tile.y + tile.height {
                for x in tile.x..tile.x + tile.width {
                    covered[(y * 10 + x) as usize] += 1;
                }
            }
        }
        assert!(covered.iter().all(|&c| c == 1));
    }

    #[test]
    fn test_edge_tiles_are_clipped() {
        let tiles = Tile::grid(5, 5, 4);
        assert_eq!(
            tiles,
            vec![
                Tile { x: 0, y: 0, width: 4, height: 4 },
                Tile { x: 4, y: 0, width: 1, height: 4 },
                Tile { x: 0, y: 4, width: 4, height: 1 },
                Tile { x: 4, y: 4, width: 1, height: 1 },
            ]
        );
    }

    #[test]
    fn test_empty_image_has_no_tiles() {
        assert!(Tile::grid(0, 5, 4).is_empty());
        assert!(Tile::grid(5, 0, 4).is_empty());
    }

    #[test]
    fn test_tile_size_does_not_change_result() {
        let image = RgbImage::from_fn(13, 9, |x, y| {
            Rgb([(x * 19) as u8, (y * 27) as u8, ((x + y) * 11) as u8])
        });
        let mixing = MixingMatrix::from_colors([230, 200, 220], [60, 40, 140]);
        let problem = UnmixProblem::new(&mixing, &SolverSettings::default());

        let whole = solve_tiled(&image, &problem, 64);
        let small = solve_tiled(&image, &problem, 4);
        let single = solve_tiled(&image, &problem, 1);

        assert_eq!(whole.components, small.components);
        assert_eq!(whole.components, single.components);
        assert_eq!(whole.statuses, small.statuses);
    }

    #[test]
    fn test_stitching_places_pixels_in_row_major_order() {
        let image = RgbImage::from_fn(6, 5, |x, y| {
            if (x + y) % 2 == 0 {
                Rgb([230, 200, 220])
            } else {
                Rgb([0, 0, 0])
            }
        });
        let mixing = MixingMatrix::from_colors([230, 200, 220], [60, 40, 140]);
        let problem = UnmixProblem::new(&mixing, &SolverSettings::default());
        let output = solve_tiled(&image, &problem, 4);

        for y in 0..5u32 {
            for x in 0..6u32 {
                let [background, _] = output.components[(y * 6 + x) as usize];
                if (x + y) % 2 == 0 {
                    assert!((background - 1.0).abs() < 1e-4);
                } else {
                    assert_eq!(background, 0.0);
                }
            }
        }
    }
}

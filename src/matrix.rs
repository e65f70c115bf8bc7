use nalgebra::{Matrix2, Matrix3x2, Vector3};

use crate::color::{Color, NormalizedColor, normalize_color};
use crate::error::{ColormapError, Result};

/// Below this squared sine of the angle between the two columns (about 1.8°)
/// the matrix is reported as degenerate
pub const DEGENERACY_THRESHOLD: f32 = 1e-3;

/// Column index of the background component
pub const BACKGROUND: usize = 0;
/// Column index of the nuclei component
pub const NUCLEI: usize = 1;

/// A 3×2 matrix whose columns are two normalized RGB colors
///
/// Used both as the mixing matrix `A` (reference colors, for unmixing) and as
/// the target matrix `B` (output colors, for remixing).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MixingMatrix {
    columns: Matrix3x2<f32>,
}

impl MixingMatrix {
    /// Build a matrix from 8-bit background and nuclei colors
    pub fn from_colors(background: Color, nuclei: Color) -> Self {
        Self::from_normalized(normalize_color(background), normalize_color(nuclei))
    }

    /// Build a matrix from already-normalized colors
    pub fn from_normalized(background: NormalizedColor, nuclei: NormalizedColor) -> Self {
        let columns = Matrix3x2::from_columns(&[
            Vector3::from_row_slice(&background),
            Vector3::from_row_slice(&nuclei),
        ]);
        Self { columns }
    }

    pub fn column(&self, index: usize) -> NormalizedColor {
        let c = self.columns.column(index);
        [c[0], c[1], c[2]]
    }

    pub fn as_matrix(&self) -> &Matrix3x2<f32> {
        &self.columns
    }

    /// `AᵀA`
    pub fn gram(&self) -> Matrix2<f32> {
        self.columns.tr_mul(&self.columns)
    }

    /// Squared sine of the angle between the two columns, in [0, 1].
    /// 0 when the columns are parallel or either one is black.
    pub fn sine_squared(&self) -> f32 {
        let q = self.gram();
        let norms = q[(0, 0)] * q[(1, 1)];
        if norms <= 0.0 {
            return 0.0;
        }
        ((norms - q[(0, 1)] * q[(0, 1)]) / norms).clamp(0.0, 1.0)
    }

    pub fn is_degenerate(&self) -> bool {
        self.sine_squared() < DEGENERACY_THRESHOLD
    }

    /// Fail with `InvalidMixingMatrix` when the columns are nearly parallel
    pub fn validate(&self) -> Result<()> {
        let sine_squared = self.sine_squared();
        if sine_squared < DEGENERACY_THRESHOLD {
            return Err(ColormapError::InvalidMixingMatrix { sine_squared });
        }
        Ok(())
    }
}

/// Largest eigenvalue of a symmetric 2×2 matrix
pub fn largest_eigenvalue(q: &Matrix2<f32>) -> f32 {
    let half_trace = 0.5 * (q[(0, 0)] + q[(1, 1)]);
    let det = q[(0, 0)] * q[(1, 1)] - q[(0, 1)] * q[(1, 0)];
    half_trace + (half_trace * half_trace - det).max(0.0).sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_columns_are_normalized() {
        let m = MixingMatrix::from_colors([255, 0, 51], [0, 255, 0]);
        assert_eq!(m.column(BACKGROUND), [1.0, 0.0, 0.2]);
        assert_eq!(m.column(NUCLEI), [0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_gram_matrix() {
        let m = MixingMatrix::from_colors([255, 0, 0], [255, 255, 0]);
        let q = m.gram();
        assert_relative_eq!(q[(0, 0)], 1.0);
        assert_relative_eq!(q[(0, 1)], 1.0);
        assert_relative_eq!(q[(1, 0)], 1.0);
        assert_relative_eq!(q[(1, 1)], 2.0);
    }

    #[test]
    fn test_orthogonal_colors_are_well_conditioned() {
        let m = MixingMatrix::from_colors([255, 0, 0], [0, 0, 255]);
        assert_relative_eq!(m.sine_squared(), 1.0);
        assert!(!m.is_degenerate());
        assert!(m.validate().is_ok());
    }

    #[test]
    fn test_parallel_colors_are_degenerate() {
        // Same hue, different brightness
        let m = MixingMatrix::from_colors([200, 100, 50], [100, 50, 25]);
        assert!(m.is_degenerate());
        assert!(matches!(
            m.validate(),
            Err(ColormapError::InvalidMixingMatrix { .. })
        ));
    }

    #[test]
    fn test_black_reference_is_degenerate() {
        let m = MixingMatrix::from_colors([230, 200, 220], [0, 0, 0]);
        assert_eq!(m.sine_squared(), 0.0);
        assert!(m.is_degenerate());
    }

    #[test]
    fn test_largest_eigenvalue() {
        let q = Matrix2::new(2.0, 1.0, 1.0, 2.0);
        assert_relative_eq!(largest_eigenvalue(&q), 3.0);
        assert_relative_eq!(largest_eigenvalue(&Matrix2::zeros()), 0.0);
    }
}

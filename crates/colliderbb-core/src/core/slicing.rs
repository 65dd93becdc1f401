//! Longitudinal slicing of a Gaussian bunch into equal-charge slices.
//!
//! Head-on beam-beam lenses sample the strong bunch at a set of longitudinal
//! positions. Each position is the centroid (conditional mean) of one of `N`
//! slices that carry the same fraction of the bunch population. For a
//! standard normal variable restricted to `[a, b]` the conditional mean is
//! `(phi(a) - phi(b)) / (Phi(b) - Phi(a))`, and with equal-probability cuts
//! the denominator is simply `1 / N`.

use super::special::{normal_pdf, normal_quantile};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum SlicingError {
    #[error("Number of slices must be positive")]
    ZeroSlices,
    #[error("Number of slices must be odd so that one slice sits at the collision point, got {0}")]
    EvenSliceCount(usize),
    #[error("Bunch length must be positive and finite, got {0}")]
    InvalidBunchLength(f64),
}

/// Centroids of `num_slices` equal-population slices of a Gaussian bunch with RMS length `sigma_z`.
///
/// The result is strictly increasing, antisymmetric about zero, and its middle
/// element is exactly zero. Only odd slice counts are accepted.
pub fn z_centroids(num_slices: usize, sigma_z: f64) -> Result<Vec<f64>, SlicingError> {
    validate(num_slices, sigma_z)?;

    let n = num_slices as f64;
    let half = (num_slices - 1) / 2;

    let mut lower = Vec::with_capacity(half);
    let mut previous_density = 0.0;
    for k in 1..=half {
        let cut = normal_quantile(k as f64 / n);
        let density = normal_pdf(cut);
        lower.push(sigma_z * (previous_density - density) * n);
        previous_density = density;
    }

    let mut centroids = Vec::with_capacity(num_slices);
    centroids.extend_from_slice(&lower);
    centroids.push(0.0);
    centroids.extend(lower.iter().rev().map(|z| -z));
    Ok(centroids)
}

/// Same as [`z_centroids`], paired with the signed slice index running from
/// `-(N-1)/2` to `(N-1)/2`.
pub fn indexed_z_centroids(
    num_slices: usize,
    sigma_z: f64,
) -> Result<Vec<(i32, f64)>, SlicingError> {
    let centroids = z_centroids(num_slices, sigma_z)?;
    let half = ((num_slices - 1) / 2) as i32;
    Ok((-half..=half).zip(centroids).collect())
}

fn validate(num_slices: usize, sigma_z: f64) -> Result<(), SlicingError> {
    if num_slices == 0 {
        return Err(SlicingError::ZeroSlices);
    }
    if num_slices % 2 == 0 {
        return Err(SlicingError::EvenSliceCount(num_slices));
    }
    if !(sigma_z.is_finite() && sigma_z > 0.0) {
        return Err(SlicingError::InvalidBunchLength(sigma_z));
    }
    Ok(())
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Smoothing and spectral bookkeeping for variance maps.

use std::f64::consts::PI;

use crate::map::MaskedMap;
use crate::sphere::{map_nside, pixel_area, smoothing, SphereError};

/// Smooth a per-pixel variance map to match a signal map smoothed with a
/// Gaussian beam of the given FWHM (radians).
///
/// This follows the closed-form pixel-error propagation rule ("Pixel errors
/// in convolved maps", J. P. Leahy, v0.2): the variance map itself is
/// smoothed with an effective FWHM of `fwhm / sqrt(2)` and rescaled by
/// `pixel_area / (4 pi sigma_beam^2)`. Reusing the signal smoother on a
/// variance map underestimates the post-smoothing errors and quietly skews
/// every chi-square built from them.
pub fn smooth_variance_map(variance: &[f64], fwhm: f64) -> Result<Vec<f64>, SphereError> {
    let nside = map_nside(variance)?;

    let fwhm_variance = fwhm / 2.0_f64.sqrt();
    let mut smoothed = smoothing(variance, fwhm_variance)?;

    let beam_sigma = fwhm / (8.0 * 2.0_f64.ln()).sqrt();
    let a_vb = pixel_area(nside) / (4.0 * PI * beam_sigma * beam_sigma);
    for v in smoothed.iter_mut() {
        *v *= a_vb;
    }
    Ok(smoothed)
}

/// The white-noise spectral floor expected from a variance map over the
/// unmasked sky, in the units of the (half-difference scaled back to
/// average) spectral estimate: `mean(variance / 4) * pixel_area`.
pub fn whitenoise_cl(variance: &MaskedMap) -> Result<f64, SphereError> {
    let nside = variance.nside()?;
    let mut sum = 0.0;
    let mut n = 0usize;
    for (&v, &m) in variance.values.iter().zip(variance.mask.iter()) {
        if !m {
            sum += v / 4.0;
            n += 1;
        }
    }
    if n == 0 {
        return Ok(0.0);
    }
    Ok(sum / n as f64 * pixel_area(nside))
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::sphere::nside2npix;

    #[test]
    fn test_uniform_variance_scales_by_beam_area() {
        // Smoothing a constant variance map leaves a constant, so only the
        // normalisation factor remains.
        let nside = 16;
        let fwhm = 0.1_f64;
        let variance = vec![2.0; nside2npix(nside)];
        let smoothed = smooth_variance_map(&variance, fwhm).unwrap();
        let beam_sigma = fwhm / (8.0 * 2.0_f64.ln()).sqrt();
        let expected = 2.0 * pixel_area(nside) / (4.0 * PI * beam_sigma * beam_sigma);
        for &v in &smoothed {
            assert_abs_diff_eq!(v, expected, epsilon = expected * 1e-2);
        }
    }

    #[test]
    fn test_whitenoise_floor_of_unit_variance() {
        let nside = 8;
        let variance = MaskedMap::from_raw(vec![1.0; nside2npix(nside)]);
        let floor = whitenoise_cl(&variance).unwrap();
        assert_abs_diff_eq!(floor, pixel_area(nside) / 4.0, epsilon = 1e-15);
    }

    #[test]
    fn test_whitenoise_floor_ignores_masked_pixels() {
        let nside = 8;
        let npix = nside2npix(nside);
        let mut variance = MaskedMap::from_raw(vec![1.0; npix]);
        // Outliers behind the mask must not shift the floor.
        for p in 0..npix / 2 {
            variance.values[p] = 1e6;
            variance.mask[p] = true;
        }
        let floor = whitenoise_cl(&variance).unwrap();
        assert_abs_diff_eq!(floor, pixel_area(nside) / 4.0, epsilon = 1e-15);
    }
}

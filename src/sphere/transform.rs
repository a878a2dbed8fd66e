// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Scalar spherical-harmonic transforms.
//!
//! The transforms exploit the isolatitude ring structure of the pixelisation:
//! an FFT in azimuth per ring, then an associated-Legendre recurrence in
//! colatitude. Quadrature weights are the (uniform) pixel solid angle, the
//! same approximation the usual one-pass `map2alm` makes.

use std::collections::HashMap;
use std::f64::consts::PI;
use std::sync::Arc;

use ndarray::parallel::prelude::*;
use ndarray::{Array2, Axis};
use num_complex::Complex;
use rayon::prelude::*;
use rustfft::{Fft, FftPlanner};

use super::pixel::{map_nside, nside2npix, ring_layout, Ring};
use super::SphereError;

/// Harmonic coefficients a_lm, indexed `[[l, m]]`; only `m <= l` is
/// meaningful.
pub type Alm = Array2<Complex<f64>>;

/// The default band limit used for smoothing and spectra.
pub fn default_lmax(nside: usize) -> usize {
    3 * nside - 1
}

/// Normalised associated Legendre functions λ_lm(z) for fixed m, written to
/// `lam[l - m]` for l = m..=lmax. Y_lm = λ_lm e^{i m φ}.
fn legendre_column(m: usize, lmax: usize, z: f64, sth: f64, lam: &mut [f64]) {
    let mut p_mm = (1.0 / (4.0 * PI)).sqrt();
    for k in 1..=m {
        p_mm *= -((2 * k + 1) as f64 / (2 * k) as f64).sqrt() * sth;
    }
    lam[0] = p_mm;
    if lmax == m {
        return;
    }
    let mut p_prev = p_mm;
    let mut p_curr = z * ((2 * m + 3) as f64).sqrt() * p_mm;
    lam[1] = p_curr;
    let m2 = (m * m) as f64;
    for l in (m + 2)..=lmax {
        let l2 = (l * l) as f64;
        let lm12 = ((l - 1) * (l - 1)) as f64;
        let a = ((4.0 * l2 - 1.0) / (l2 - m2)).sqrt();
        let b = ((lm12 - m2) / (4.0 * lm12 - 1.0)).sqrt();
        let p_next = a * (z * p_curr - b * p_prev);
        lam[l - m] = p_next;
        p_prev = p_curr;
        p_curr = p_next;
    }
}

/// Analyse a RING-ordered map into harmonic coefficients up to `lmax`.
pub fn map2alm(map: &[f64], lmax: usize) -> Result<Alm, SphereError> {
    let nside = map_nside(map)?;
    let rings = ring_layout(nside);
    let omega = 4.0 * PI / map.len() as f64;

    // Per-ring azimuthal Fourier coefficients F_m, phase-referenced to φ=0.
    let mut planner = FftPlanner::new();
    let f: Vec<Vec<Complex<f64>>> = rings
        .iter()
        .map(|ring| {
            let fft = planner.plan_fft_forward(ring.count);
            let mut buf: Vec<Complex<f64>> = map[ring.start..ring.start + ring.count]
                .iter()
                .map(|&v| Complex::new(v, 0.0))
                .collect();
            fft.process(&mut buf);
            (0..=lmax)
                .map(|m| buf[m % ring.count] * Complex::from_polar(1.0, -(m as f64) * ring.phi0))
                .collect()
        })
        .collect();

    let mut alm = Array2::zeros((lmax + 1, lmax + 1));
    alm.axis_iter_mut(Axis(1))
        .into_par_iter()
        .enumerate()
        .for_each(|(m, mut col)| {
            let mut lam = vec![0.0; lmax + 1 - m];
            for (ring, fm) in rings.iter().zip(f.iter()) {
                let sth = (1.0 - ring.z * ring.z).max(0.0).sqrt();
                legendre_column(m, lmax, ring.z, sth, &mut lam);
                let w = fm[m] * omega;
                for l in m..=lmax {
                    col[l] += w * lam[l - m];
                }
            }
        });
    Ok(alm)
}

/// Synthesise a RING-ordered map at `nside` from harmonic coefficients.
pub fn alm2map(alm: &Alm, nside: usize) -> Result<Vec<f64>, SphereError> {
    if !super::pixel::is_valid_nside(nside) {
        return Err(SphereError::BadNside(nside));
    }
    let lmax = alm.nrows() - 1;
    let rings = ring_layout(nside);

    let mut planner = FftPlanner::new();
    let plans: HashMap<usize, Arc<dyn Fft<f64>>> = rings
        .iter()
        .map(|ring| ring.count)
        .collect::<std::collections::HashSet<_>>()
        .into_iter()
        .map(|n| (n, planner.plan_fft_inverse(n)))
        .collect();

    let ring_values: Vec<Vec<f64>> = rings
        .par_iter()
        .map(|ring: &Ring| {
            let n = ring.count;
            let sth = (1.0 - ring.z * ring.z).max(0.0).sqrt();
            let mut c = vec![Complex::new(0.0, 0.0); n];
            let mut lam = vec![0.0; lmax + 1];
            for m in 0..=lmax {
                legendre_column(m, lmax, ring.z, sth, &mut lam[..lmax + 1 - m]);
                let mut g = Complex::new(0.0, 0.0);
                for l in m..=lmax {
                    g += alm[[l, m]] * lam[l - m];
                }
                // Fold m (and its negative-frequency mirror) into the DFT
                // bins of this ring, aliasing included.
                let h = g * Complex::from_polar(1.0, m as f64 * ring.phi0);
                c[m % n] += h;
                if m > 0 {
                    c[(n - m % n) % n] += h.conj();
                }
            }
            let mut buf = c;
            plans[&n].process(&mut buf);
            buf.iter().map(|v| v.re).collect()
        })
        .collect();

    let mut out = vec![0.0; nside2npix(nside)];
    for (ring, vals) in rings.iter().zip(ring_values) {
        out[ring.start..ring.start + ring.count].copy_from_slice(&vals);
    }
    Ok(out)
}

/// The transfer function of a Gaussian beam with the given FWHM (radians).
pub fn gauss_beam(fwhm: f64, lmax: usize) -> Vec<f64> {
    let sigma2 = fwhm * fwhm / (8.0 * 2.0_f64.ln());
    (0..=lmax)
        .map(|l| (-0.5 * (l * (l + 1)) as f64 * sigma2).exp())
        .collect()
}

/// Convolve a map with a Gaussian beam of the given FWHM (radians).
pub fn smoothing(map: &[f64], fwhm: f64) -> Result<Vec<f64>, SphereError> {
    let nside = map_nside(map)?;
    let lmax = default_lmax(nside);
    let mut alm = map2alm(map, lmax)?;
    let bl = gauss_beam(fwhm, lmax);
    for ((l, _), v) in alm.indexed_iter_mut() {
        *v *= bl[l];
    }
    alm2map(&alm, nside)
}

/// The angular auto power spectrum C_l of a map, l = 0..=lmax.
pub fn anafast(map: &[f64], lmax: Option<usize>) -> Result<Vec<f64>, SphereError> {
    let nside = map_nside(map)?;
    let lmax = lmax.unwrap_or_else(|| default_lmax(nside));
    let alm = map2alm(map, lmax)?;
    Ok((0..=lmax)
        .map(|l| {
            let mut s = alm[[l, 0]].norm_sqr();
            for m in 1..=l {
                s += 2.0 * alm[[l, m]].norm_sqr();
            }
            s / (2 * l + 1) as f64
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_legendre_low_orders() {
        let z = 0.3_f64;
        let sth = (1.0 - z * z).sqrt();
        let mut lam = vec![0.0; 3];
        legendre_column(0, 2, z, sth, &mut lam);
        assert_abs_diff_eq!(lam[0], (1.0 / (4.0 * PI)).sqrt(), epsilon = 1e-12);
        assert_abs_diff_eq!(lam[1], (3.0 / (4.0 * PI)).sqrt() * z, epsilon = 1e-12);
        assert_abs_diff_eq!(
            lam[2],
            (5.0 / (4.0 * PI)).sqrt() * 0.5 * (3.0 * z * z - 1.0),
            epsilon = 1e-12
        );
        let mut lam1 = vec![0.0; 2];
        legendre_column(1, 2, z, sth, &mut lam1);
        assert_abs_diff_eq!(lam1[0], -(3.0 / (8.0 * PI)).sqrt() * sth, epsilon = 1e-12);
    }

    #[test]
    fn test_monopole_round_trip() {
        let nside = 8;
        let map = vec![2.5; nside2npix(nside)];
        let alm = map2alm(&map, 8).unwrap();
        // a_00 of a constant map is 2.5 sqrt(4π); everything else vanishes.
        assert_abs_diff_eq!(
            alm[[0, 0]].re,
            2.5 * (4.0 * PI).sqrt(),
            epsilon = 1e-9
        );
        assert_abs_diff_eq!(alm[[1, 0]].norm(), 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(alm[[2, 1]].norm(), 0.0, epsilon = 1e-9);
        let back = alm2map(&alm, nside).unwrap();
        // The uniform-weight quadrature is not exact for l >= 2, so the
        // reconstruction carries a small ripple.
        for &v in &back {
            assert_abs_diff_eq!(v, 2.5, epsilon = 5e-3);
        }
    }

    #[test]
    fn test_dipole_round_trip() {
        // A pure Y_10 pattern must come back unchanged through
        // analysis/synthesis at a band limit well above l = 1.
        let nside = 16;
        let rings = ring_layout(nside);
        let mut map = vec![0.0; nside2npix(nside)];
        for ring in &rings {
            for p in ring.start..ring.start + ring.count {
                map[p] = 0.7 * ring.z;
            }
        }
        let alm = map2alm(&map, 32).unwrap();
        let back = alm2map(&alm, nside).unwrap();
        for (a, b) in map.iter().zip(back.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 5e-3);
        }
    }

    #[test]
    fn test_smoothing_preserves_monopole() {
        let nside = 8;
        let map = vec![1.0; nside2npix(nside)];
        let sm = smoothing(&map, 0.1).unwrap();
        for &v in &sm {
            assert_abs_diff_eq!(v, 1.0, epsilon = 5e-3);
        }
    }

    #[test]
    fn test_anafast_dipole() {
        // map = z has a_10 = sqrt(4π/3), so C_1 = 4π/9.
        let nside = 16;
        let rings = ring_layout(nside);
        let mut map = vec![0.0; nside2npix(nside)];
        for ring in &rings {
            for p in ring.start..ring.start + ring.count {
                map[p] = ring.z;
            }
        }
        let cl = anafast(&map, Some(8)).unwrap();
        assert_abs_diff_eq!(cl[1], 4.0 * PI / 9.0, epsilon = 5e-3);
        // a_00 and all m != 0 sums cancel exactly by ring symmetry.
        assert_abs_diff_eq!(cl[0], 0.0, epsilon = 1e-9);
        assert_abs_diff_eq!(cl[2], 0.0, epsilon = 1e-9);
    }

    #[test]
    fn test_gauss_beam() {
        let bl = gauss_beam(0.1, 4);
        assert_abs_diff_eq!(bl[0], 1.0);
        assert!(bl[4] < bl[1]);
        assert!(bl[4] > 0.0);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Least-squares monopole and dipole fitting.

use scorus::healpix::pix::pix2vec_ring;

use super::pixel::{is_bad, map_nside};
use super::SphereError;

/// Fit a monopole plus dipole to the unmasked pixels of a RING-ordered map,
/// excluding pixels within `gal_cut_deg` degrees of the galactic equator.
/// Returns the monopole and the dipole vector in map units.
pub fn fit_dipole(
    map: &[f64],
    mask: &[bool],
    gal_cut_deg: f64,
) -> Result<(f64, [f64; 3]), SphereError> {
    let nside = map_nside(map)?;
    let zcut = gal_cut_deg.to_radians().sin();

    // Normal equations for the model m + d·n over the fitted pixels.
    let mut ata = [[0.0_f64; 4]; 4];
    let mut atb = [0.0_f64; 4];
    for (p, (&v, &excluded)) in map.iter().zip(mask.iter()).enumerate() {
        if excluded || is_bad(v) {
            continue;
        }
        let n = pix2vec_ring::<f64>(nside, p);
        if n[2].abs() < zcut {
            continue;
        }
        let row = [1.0, n[0], n[1], n[2]];
        for i in 0..4 {
            atb[i] += row[i] * v;
            for j in 0..4 {
                ata[i][j] += row[i] * row[j];
            }
        }
    }

    let sol = solve4(ata, atb).ok_or(SphereError::DegenerateDipoleFit)?;
    Ok((sol[0], [sol[1], sol[2], sol[3]]))
}

/// Subtract a fitted monopole and dipole from every pixel of the map.
pub fn remove_dipole(map: &mut [f64], monopole: f64, dipole: [f64; 3]) {
    let nside = match map_nside(map) {
        Ok(n) => n,
        Err(_) => return,
    };
    for (p, v) in map.iter_mut().enumerate() {
        if is_bad(*v) {
            continue;
        }
        let n = pix2vec_ring::<f64>(nside, p);
        *v -= monopole + dipole[0] * n[0] + dipole[1] * n[1] + dipole[2] * n[2];
    }
}

/// Solve a 4x4 linear system by Gaussian elimination with partial pivoting.
/// Returns None for a (numerically) singular system.
fn solve4(a: [[f64; 4]; 4], b: [f64; 4]) -> Option<[f64; 4]> {
    let mut m = [[0.0_f64; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&a[i]);
        m[i][4] = b[i];
    }
    for col in 0..4 {
        let pivot = (col..4).max_by(|&i, &j| {
            m[i][col]
                .abs()
                .partial_cmp(&m[j][col].abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })?;
        if m[pivot][col].abs() < 1e-300 {
            return None;
        }
        m.swap(col, pivot);
        for row in col + 1..4 {
            let f = m[row][col] / m[col][col];
            for k in col..5 {
                m[row][k] -= f * m[col][k];
            }
        }
    }
    let mut x = [0.0_f64; 4];
    for i in (0..4).rev() {
        let mut s = m[i][4];
        for k in i + 1..4 {
            s -= m[i][k] * x[k];
        }
        x[i] = s / m[i][i];
    }
    Some(x)
}

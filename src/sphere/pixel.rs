// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! RING-scheme pixel bookkeeping and resolution changes.

use std::f64::consts::PI;

use scorus::healpix::pix::{pix2vec_ring, ring2z_ring};

use super::SphereError;
use crate::constants::{UNSEEN, UNSEEN_CUTOFF};

pub fn is_valid_nside(nside: usize) -> bool {
    nside > 0 && nside.is_power_of_two()
}

pub fn nside2npix(nside: usize) -> usize {
    scorus::healpix::utils::nside2npix(nside)
}

/// The nside of a map, or an error if its length is not a valid pixel count.
pub fn map_nside(map: &[f64]) -> Result<usize, SphereError> {
    let npix = map.len();
    let nside = ((npix / 12) as f64).sqrt().round() as usize;
    if !is_valid_nside(nside) || 12 * nside * nside != npix {
        return Err(SphereError::BadNpix(npix));
    }
    Ok(nside)
}

/// The solid angle of one pixel (steradians).
pub fn pixel_area(nside: usize) -> f64 {
    4.0 * PI / nside2npix(nside) as f64
}

/// Is this pixel value the bad-pixel sentinel (or NaN)?
#[inline]
pub fn is_bad(v: f64) -> bool {
    !(v > UNSEEN_CUTOFF)
}

/// One isolatitude ring of pixels. `start` and `count` index into a
/// RING-ordered map; `z` is cos(colatitude) and `phi0` the azimuth of the
/// first pixel.
pub(super) struct Ring {
    pub(super) start: usize,
    pub(super) count: usize,
    pub(super) z: f64,
    pub(super) phi0: f64,
}

/// All rings of an nside pixelisation, north to south.
pub(super) fn ring_layout(nside: usize) -> Vec<Ring> {
    let npix = nside2npix(nside);
    (1..=4 * nside - 1)
        .map(|i| {
            let (start, count) = if i < nside {
                (2 * i * (i - 1), 4 * i)
            } else if i <= 3 * nside {
                (2 * nside * (nside - 1) + (i - nside) * 4 * nside, 4 * nside)
            } else {
                let m = 4 * nside - i;
                (npix - 2 * m * (m + 1), 4 * m)
            };
            let v = pix2vec_ring::<f64>(nside, start);
            Ring {
                start,
                count,
                z: ring2z_ring::<f64>(nside, i),
                phi0: v[1].atan2(v[0]).rem_euclid(2.0 * PI),
            }
        })
        .collect()
}

// Face rows and offsets of the twelve base pixels, as in the reference
// HEALPix implementation.
const JRLL: [i64; 12] = [2, 2, 2, 2, 3, 3, 3, 3, 4, 4, 4, 4];
const JPLL: [i64; 12] = [1, 3, 5, 7, 0, 2, 4, 6, 1, 3, 5, 7];

/// Keep the even-position bits of `v`, packed contiguously.
fn compress_bits(v: usize) -> usize {
    let mut x = v & 0x5555_5555_5555_5555;
    x = (x | (x >> 1)) & 0x3333_3333_3333_3333;
    x = (x | (x >> 2)) & 0x0f0f_0f0f_0f0f_0f0f;
    x = (x | (x >> 4)) & 0x00ff_00ff_00ff_00ff;
    x = (x | (x >> 8)) & 0x0000_ffff_0000_ffff;
    (x | (x >> 16)) & 0x0000_0000_ffff_ffff
}

/// Convert a NESTED pixel index to the RING index at the same nside.
pub fn nest2ring(nside: usize, ipix: usize) -> usize {
    debug_assert!(is_valid_nside(nside));
    let npix = nside2npix(nside);
    let npface = nside * nside;
    let face = ipix / npface;
    let ix = compress_bits(ipix % npface) as i64;
    let iy = compress_bits((ipix % npface) >> 1) as i64;

    // Ring number counted from the north pole, 1..4 nside - 1.
    let jr = JRLL[face] * nside as i64 - ix - iy - 1;
    let (nr, start, kshift) = if jr < nside as i64 {
        let nr = jr as usize;
        (nr, 2 * nr * (nr - 1), 0)
    } else if jr > 3 * nside as i64 {
        let nr = 4 * nside - jr as usize;
        (nr, npix - 2 * nr * (nr + 1), 0)
    } else {
        let ncap = 2 * nside * (nside - 1);
        (
            nside,
            ncap + (jr as usize - nside) * 4 * nside,
            (jr - nside as i64) & 1,
        )
    };

    let mut jp = (JPLL[face] * nr as i64 + ix - iy + 1 + kshift) / 2;
    if jp > 4 * nr as i64 {
        jp -= 4 * nr as i64;
    }
    if jp < 1 {
        jp += 4 * nr as i64;
    }
    start + (jp - 1) as usize
}

/// Change the resolution of a RING-ordered map.
///
/// Degrading averages the good child pixels of each output pixel (all-bad
/// children yield a bad output pixel); upgrading copies the parent value to
/// each child. The result is additionally scaled by
/// `(nside_out / nside_in)^power`: `power = 0` preserves mean surface
/// brightness (signal maps), `power = 2` is correct for variance maps, and
/// `power = -2` preserves the map sum.
pub fn ud_grade(map: &[f64], nside_out: usize, power: i32) -> Result<Vec<f64>, SphereError> {
    let nside_in = map_nside(map)?;
    if !is_valid_nside(nside_out) {
        return Err(SphereError::BadNside(nside_out));
    }
    let scale = (nside_out as f64 / nside_in as f64).powi(power);
    if nside_out == nside_in {
        return Ok(map
            .iter()
            .map(|&v| if is_bad(v) { UNSEEN } else { v * scale })
            .collect());
    }

    if nside_out < nside_in {
        let ratio = (nside_in / nside_out) * (nside_in / nside_out);
        let npix_out = nside2npix(nside_out);
        let mut out = vec![UNSEEN; npix_out];
        for p in 0..npix_out {
            let mut sum = 0.0;
            let mut n = 0usize;
            for child in p * ratio..(p + 1) * ratio {
                let v = map[nest2ring(nside_in, child)];
                if !is_bad(v) {
                    sum += v;
                    n += 1;
                }
            }
            if n > 0 {
                out[nest2ring(nside_out, p)] = sum / n as f64 * scale;
            }
        }
        Ok(out)
    } else {
        let ratio = (nside_out / nside_in) * (nside_out / nside_in);
        let npix_in = nside2npix(nside_in);
        let mut out = vec![UNSEEN; nside2npix(nside_out)];
        for p in 0..npix_in {
            let v = map[nest2ring(nside_in, p)];
            if is_bad(v) {
                continue;
            }
            for child in p * ratio..(p + 1) * ratio {
                out[nest2ring(nside_out, child)] = v * scale;
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;

    #[test]
    fn test_map_nside() {
        assert_eq!(map_nside(&vec![0.0; 12]).unwrap(), 1);
        assert_eq!(map_nside(&vec![0.0; 12 * 16 * 16]).unwrap(), 16);
        assert!(map_nside(&vec![0.0; 13]).is_err());
        // 12 * 3^2 pixels, but nside 3 is not a power of two.
        assert!(map_nside(&vec![0.0; 108]).is_err());
    }

    #[test]
    fn test_ring_layout_covers_all_pixels() {
        for nside in [1, 2, 8] {
            let rings = ring_layout(nside);
            assert_eq!(rings.len(), 4 * nside - 1);
            let mut next = 0;
            for ring in &rings {
                assert_eq!(ring.start, next);
                next += ring.count;
            }
            assert_eq!(next, nside2npix(nside));
        }
    }

    #[test]
    fn test_nest2ring_known_values() {
        // At nside 1 both orderings coincide.
        for p in 0..12 {
            assert_eq!(nest2ring(1, p), p);
        }
        // Values checked against the reference implementation.
        assert_eq!(nest2ring(2, 0), 13);
        assert_eq!(nest2ring(2, 1), 5);
        assert_eq!(nest2ring(2, 2), 4);
        assert_eq!(nest2ring(2, 3), 0);
    }

    #[test]
    fn test_nest2ring_is_a_permutation() {
        for nside in [2, 4, 8] {
            let npix = nside2npix(nside);
            let mut seen = vec![false; npix];
            for p in 0..npix {
                let r = nest2ring(nside, p);
                assert!(!seen[r]);
                seen[r] = true;
            }
        }
    }

    #[test]
    fn test_ud_grade_constant_map() {
        let map = vec![3.0; nside2npix(16)];
        let down = ud_grade(&map, 4, 0).unwrap();
        assert_eq!(down.len(), nside2npix(4));
        for &v in &down {
            assert_abs_diff_eq!(v, 3.0);
        }
        let up = ud_grade(&down, 16, 0).unwrap();
        for &v in &up {
            assert_abs_diff_eq!(v, 3.0);
        }
    }

    #[test]
    fn test_ud_grade_variance_scaling() {
        // Degrading a variance map by a factor 4 in nside averages 16
        // pixels, so the variance of the mean drops by 16.
        let map = vec![1.0; nside2npix(16)];
        let down = ud_grade(&map, 4, 2).unwrap();
        for &v in &down {
            assert_abs_diff_eq!(v, 1.0 / 16.0);
        }
    }

    #[test]
    fn test_ud_grade_bad_pixels() {
        let mut map = vec![2.0; nside2npix(4)];
        // Blank out all children of the first output pixel and one child of
        // the second.
        for child in 0..16 {
            map[nest2ring(4, child)] = UNSEEN;
        }
        map[nest2ring(4, 16)] = UNSEEN;
        let down = ud_grade(&map, 1, 0).unwrap();
        assert!(is_bad(down[nest2ring(1, 0)]));
        assert_abs_diff_eq!(down[nest2ring(1, 1)], 2.0);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Boolean exclusion masks.
//!
//! Mask files on disk mark *valid* pixels with 1; in memory the convention is
//! inverted (`true` = pixel excluded), so masks can be unioned with a plain
//! logical OR.

use std::path::Path;

use crate::io::fits::{read_map_columns, FitsError};
use crate::sphere::{is_bad, ud_grade, SphereError};

/// `true` = exclude this pixel.
pub type Mask = Vec<bool>;

#[derive(thiserror::Error, Debug)]
pub enum MaskError {
    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error(transparent)]
    Sphere(#[from] SphereError),
}

/// Read a mask map, harmonise it to `nside` (or keep the file's own
/// resolution), and convert to the internal convention: a pixel is excluded
/// unless its degraded value still floors to at least one.
pub fn read_mask(path: &Path, nside: Option<usize>) -> Result<Mask, MaskError> {
    let raw = read_map_columns(path, &[0])?.into_iter().next().unwrap();
    let graded = match nside {
        Some(nside) => ud_grade(&raw, nside, 0)?,
        None => raw,
    };
    Ok(graded
        .iter()
        .map(|&v| is_bad(v) || v.floor() < 1.0)
        .collect())
}

/// OR `src` into `dst`.
pub fn or_into(dst: &mut Mask, src: &[bool]) {
    for (d, &s) in dst.iter_mut().zip(src.iter()) {
        *d |= s;
    }
}

/// Fraction of the sky left unmasked.
pub fn sky_fraction(mask: &Mask) -> f64 {
    if mask.is_empty() {
        return 0.0;
    }
    mask.iter().filter(|&&m| !m).count() as f64 / mask.len() as f64
}

/// A mask as a writable pixel array (1 = excluded, matching the union-mask
/// product convention).
pub fn to_map(mask: &Mask) -> Vec<f64> {
    mask.iter().map(|&m| if m { 1.0 } else { 0.0 }).collect()
}

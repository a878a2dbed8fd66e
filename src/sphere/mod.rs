// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Spherical map algebra on RING-ordered HEALPix maps.
//!
//! This module is the numeric backend for the rest of the crate: pixel
//! bookkeeping, resolution changes, spherical-harmonic transforms, Gaussian
//! smoothing, power-spectrum estimation and monopole/dipole fitting. Pixel
//! geometry comes from `scorus`; the Fourier stage of the transforms uses
//! `rustfft`.

mod dipole;
mod pixel;
mod transform;

pub use dipole::{fit_dipole, remove_dipole};
pub use pixel::{
    is_bad, is_valid_nside, map_nside, nest2ring, nside2npix, pixel_area, ud_grade,
};
pub use transform::{alm2map, anafast, default_lmax, gauss_beam, map2alm, smoothing, Alm};

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SphereError {
    #[error("nside {0} is not a power of two")]
    BadNside(usize),

    #[error("Map length {0} is not 12 nside^2 for any power-of-two nside")]
    BadNpix(usize),

    #[error("Monopole/dipole fit is degenerate; too few unmasked pixels")]
    DegenerateDipoleFit,
}

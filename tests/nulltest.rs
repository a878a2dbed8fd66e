// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The null-hypothesis regression: a pure white-noise map with a matching
//! variance map must come out of the combiner with chi-squares of one and a
//! white-noise floor that matches the measured spectrum plateau.

use vec1::vec1;

use skynull::combine::{smooth_combine, CombineOptions};
use skynull::io::fits::read_cl;
use skynull::io::metadata::Metadata;
use skynull::map::{MapSet, MaskedMap, Stokes};
use skynull::sphere::nside2npix;

/// Deterministic standard normal deviates (xorshift + Box-Muller); enough
/// randomness for a noise realisation without pulling in an RNG crate.
struct Normals {
    state: u64,
    spare: Option<f64>,
}

impl Normals {
    fn new(seed: u64) -> Normals {
        Normals {
            state: seed.max(1),
            spare: None,
        }
    }

    fn next_uniform(&mut self) -> f64 {
        let mut x = self.state;
        x ^= x << 13;
        x ^= x >> 7;
        x ^= x << 17;
        self.state = x;
        (x >> 11) as f64 / (1u64 << 53) as f64
    }

    fn next(&mut self) -> f64 {
        if let Some(z) = self.spare.take() {
            return z;
        }
        let (mut u1, u2) = (self.next_uniform(), self.next_uniform());
        if u1 <= 0.0 {
            u1 = f64::MIN_POSITIVE;
        }
        let r = (-2.0 * u1.ln()).sqrt();
        let (s, c) = (2.0 * std::f64::consts::PI * u2).sin_cos();
        self.spare = Some(r * s);
        r * c
    }
}

#[test]
fn white_noise_null_hypothesis() {
    let nside = 256;
    let npix = nside2npix(nside);
    let dir = tempfile::tempdir().unwrap();

    let mut rng = Normals::new(0x5eed_cafe);
    let noise: Vec<f64> = (0..npix).map(|_| rng.next()).collect();
    let maps = MapSet::new(vec![Stokes::I], vec![MaskedMap::from_raw(noise)]);
    let variances = MapSet::new(vec![Stokes::A], vec![MaskedMap::from_raw(vec![1.0; npix])]);
    let no_mask = vec![false; npix];

    let options = CombineOptions {
        fwhm: 2.0_f64.to_radians(),
        degraded_nside: 32,
        spectra: true,
        output_folder: dir.path().to_path_buf(),
        base_file_name: "out".to_string(),
    };
    smooth_combine(
        &vec1![(maps, 1.0)],
        &vec1![(variances, 1.0)],
        &no_mask,
        &no_mask,
        &options,
        Metadata::default(),
    )
    .unwrap();

    // Check the chi-squares.
    let metadata = Metadata::read(&dir.path().join("out_map.json")).unwrap();
    let unsmoothed_chi2 = metadata.value("map_unsm_chi2").unwrap();
    assert!(
        (unsmoothed_chi2 - 1.0).abs() < 0.01,
        "raw chi2 {unsmoothed_chi2}"
    );
    let smoothed_chi2 = metadata.value("map_chi2").unwrap();
    assert!(
        (smoothed_chi2 - 1.0).abs() < 0.1,
        "smoothed chi2 {smoothed_chi2}"
    );

    // Check the white-noise floor against the measured high-l plateau.
    let cl_metadata = Metadata::read(&dir.path().join("out_cl.json")).unwrap();
    let floor = cl_metadata.value("whitenoise_cl").unwrap();
    let cl = read_cl(&dir.path().join("out_cl.fits")).unwrap();
    let plateau = cl[200..].iter().sum::<f64>() / (cl.len() - 200) as f64;
    assert!(
        (plateau - floor).abs() < 1e-5,
        "plateau {plateau}, floor {floor}"
    );
    assert_eq!(cl_metadata.value("sky_fraction").unwrap(), 1.0);
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Combining weighted maps and reporting on the result.
//!
//! [smooth_combine] is the numerical core of every null test. Its stages run
//! in a fixed order; reordering them changes the numbers:
//!
//! 1. linear combination of the weighted inputs (and, separately, their
//!    variance maps),
//! 2. point-source mask application,
//! 3. monopole/dipole removal from the intensity component,
//! 4. optional spectral diagnostics under the stricter spectra mask,
//! 5. smoothing (signal beam for the map, pixel-error propagation for the
//!    variance),
//! 6. chi-square diagnostics (smoothed and raw),
//! 7. resolution degrade,
//! 8. persistence of map, spectrum and metadata sidecars.
//!
//! Nothing is written until every stage has succeeded, so a failed
//! comparison leaves no partial products behind.

mod variance;

pub use variance::{smooth_variance_map, whitenoise_cl};

use std::path::PathBuf;

use log::{info, warn};
use thiserror::Error;
use vec1::Vec1;

use crate::constants::{DIPOLE_FIT_GAL_CUT_DEG, UNSEEN};
use crate::io::fits::{write_cl, write_map_columns, FitsError};
use crate::io::metadata::{Metadata, MetadataError};
use crate::map::{MapSet, MaskedMap, Stokes};
use crate::mask::Mask;
use crate::sphere::{fit_dipole, remove_dipole, smoothing, ud_grade, SphereError};

#[derive(Error, Debug)]
pub enum CombineError {
    #[error("Combined inputs disagree on component count: expected {expected}, got {actual}")]
    ShapeMismatch { expected: usize, actual: usize },

    #[error("Combined inputs disagree on pixel count: expected {expected}, got {actual}")]
    NpixMismatch { expected: usize, actual: usize },

    #[error("A mask with {actual} pixels cannot apply to maps with {expected}")]
    MaskMismatch { expected: usize, actual: usize },

    #[error(transparent)]
    Sphere(#[from] SphereError),

    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error(transparent)]
    Metadata(#[from] MetadataError),

    #[error("Couldn't create the output folder {path}: {io_error}")]
    Io {
        io_error: std::io::Error,
        path: String,
    },
}

/// Everything [smooth_combine] needs to know besides its inputs.
#[derive(Debug, Clone)]
pub struct CombineOptions {
    /// Smoothing FWHM, radians.
    pub fwhm: f64,
    /// Resolution of the persisted map.
    pub degraded_nside: usize,
    /// Compute and persist spectral diagnostics.
    pub spectra: bool,
    pub output_folder: PathBuf,
    /// Products are named `<base_file_name>_map.fits` and so on.
    pub base_file_name: String,
}

impl CombineOptions {
    fn product_path(&self, suffix: &str) -> PathBuf {
        self.output_folder
            .join(format!("{}_{suffix}", self.base_file_name))
    }
}

/// Linearly combine weighted map sets, component by component. The first
/// input fixes the component count and resolution; disagreeing inputs are a
/// caller bug surfaced as an error, never silently broadcast.
pub fn combine_maps(inputs: &[(MapSet, f64)]) -> Result<MapSet, CombineError> {
    let (first, first_weight) = &inputs[0];
    let mut maps: Vec<MaskedMap> = first
        .maps
        .iter()
        .map(|m| MaskedMap {
            values: m.values.iter().map(|&v| v * first_weight).collect(),
            mask: m.mask.clone(),
        })
        .collect();

    for (set, weight) in &inputs[1..] {
        if set.maps.len() != maps.len() {
            return Err(CombineError::ShapeMismatch {
                expected: maps.len(),
                actual: set.maps.len(),
            });
        }
        for (acc, map) in maps.iter_mut().zip(set.maps.iter()) {
            if map.values.len() != acc.values.len() {
                return Err(CombineError::NpixMismatch {
                    expected: acc.values.len(),
                    actual: map.values.len(),
                });
            }
            for (a, &v) in acc.values.iter_mut().zip(map.values.iter()) {
                *a += v * weight;
            }
            acc.or_mask(&map.mask);
        }
    }
    Ok(MapSet::new(first.components.clone(), maps))
}

/// Mean of `signal^2 / variance` over pixels both maps consider good; the
/// expectation is 1 for pure noise with a correct noise model.
fn chisq(signal: &MaskedMap, variance: &MaskedMap) -> f64 {
    let mut sum = 0.0;
    let mut n = 0usize;
    for (((&s, &sm), &v), &vm) in signal
        .values
        .iter()
        .zip(signal.mask.iter())
        .zip(variance.values.iter())
        .zip(variance.mask.iter())
    {
        if !sm && !vm && v > 0.0 {
            sum += s * s / v;
            n += 1;
        }
    }
    if n == 0 {
        f64::NAN
    } else {
        sum / n as f64
    }
}

fn apply_mask(maps: &mut [MaskedMap], mask: &Mask) -> Result<(), CombineError> {
    for map in maps.iter_mut() {
        if map.mask.len() != mask.len() {
            return Err(CombineError::MaskMismatch {
                expected: map.mask.len(),
                actual: mask.len(),
            });
        }
        map.or_mask(mask);
    }
    Ok(())
}

/// Combine weighted maps (and their variances), report diagnostics, and
/// persist the products. See the module docs for the stage order.
pub fn smooth_combine(
    maps_and_weights: &Vec1<(MapSet, f64)>,
    variances_and_weights: &Vec1<(MapSet, f64)>,
    smooth_mask: &Mask,
    spectra_mask: &Mask,
    options: &CombineOptions,
    metadata: Metadata,
) -> Result<(), CombineError> {
    // 1: linear combination. Variance maps run through the same weighted
    // sum; with the +1/-1 (and +1/+1 for variances) weights the drivers
    // use, that is exact error propagation for a difference.
    let mut combined = combine_maps(maps_and_weights.as_slice())?;
    let combined_variance = combine_maps(variances_and_weights.as_slice())?;
    if combined.maps.is_empty() {
        return Err(CombineError::ShapeMismatch {
            expected: 1,
            actual: 0,
        });
    }
    if combined_variance.maps.len() != combined.maps.len() {
        return Err(CombineError::ShapeMismatch {
            expected: combined.maps.len(),
            actual: combined_variance.maps.len(),
        });
    }
    let npix = combined.maps[0].values.len();
    if combined_variance.maps[0].values.len() != npix {
        return Err(CombineError::NpixMismatch {
            expected: npix,
            actual: combined_variance.maps[0].values.len(),
        });
    }

    // 2: the point-source mask excludes pixels from everything downstream.
    apply_mask(&mut combined.maps, smooth_mask)?;

    // 3: remove the residual monopole and dipole from I, fitted away from
    // the galactic plane. Q and U keep their large-scale modes.
    let mut metadata = metadata;
    if let Some(i_idx) = combined.components.iter().position(|&c| c == Stokes::I) {
        let map = &mut combined.maps[i_idx];
        let (monopole, dipole) = fit_dipole(&map.values, &map.mask, DIPOLE_FIT_GAL_CUT_DEG)?;
        remove_dipole(&mut map.values, monopole, dipole);
        info!(
            "Removed monopole {monopole:.3e} and dipole [{:.3e}, {:.3e}, {:.3e}]",
            dipole[0], dipole[1], dipole[2]
        );
        metadata = metadata
            .with_value("removed_monopole_I", monopole)
            .with_vector("dipole_I", &dipole);
    }

    // 4: spectral diagnostics on the un-smoothed map under the stricter
    // spectra mask. The combined half-difference is halved so the spectrum
    // and the white-noise floor (variance / 4) are in average-map units.
    let mut cl_product: Option<(Option<Vec<f64>>, Metadata)> = None;
    if options.spectra {
        let saved_masks: Vec<Vec<bool>> = combined.maps.iter().map(|m| m.mask.clone()).collect();
        apply_mask(&mut combined.maps, spectra_mask)?;

        let i_idx = combined.components.iter().position(|&c| c == Stokes::I);
        match i_idx {
            Some(i_idx) if combined.maps[i_idx].unmasked_count() > 0 => {
                let npix = combined.maps[i_idx].values.len();
                let sky_fraction = combined.maps[i_idx].unmasked_count() as f64 / npix as f64;

                let halved: Vec<f64> = combined.maps[i_idx]
                    .filled(0.0)
                    .iter()
                    .map(|&v| v / 2.0)
                    .collect();
                let mut cl = crate::sphere::anafast(&halved, None)?;
                for c in cl.iter_mut() {
                    *c /= sky_fraction;
                }

                let floor = whitenoise_cl(&MaskedMap {
                    values: combined_variance.maps[i_idx].values.clone(),
                    mask: combined.maps[i_idx].mask.clone(),
                })?;
                let mut cl_metadata = metadata
                    .clone()
                    .with_base_file_name(&options.base_file_name)
                    .with_file_type(format!("{}_cl", metadata.file_type))
                    .with_value("sky_fraction", sky_fraction)
                    .with_value("whitenoise_cl", floor);

                // A polarised floor from the mean of the Q and U variances.
                let q = combined.components.iter().position(|&c| c == Stokes::Q);
                let u = combined.components.iter().position(|&c| c == Stokes::U);
                if let (Some(q), Some(u)) = (q, u) {
                    let pol_variance: Vec<f64> = combined_variance.maps[q]
                        .values
                        .iter()
                        .zip(combined_variance.maps[u].values.iter())
                        .map(|(&vq, &vu)| 0.5 * (vq + vu))
                        .collect();
                    let floor_p = whitenoise_cl(&MaskedMap {
                        values: pol_variance,
                        mask: combined.maps[i_idx].mask.clone(),
                    })?;
                    cl_metadata = cl_metadata.with_value("whitenoise_cl_P", floor_p);
                }

                // Spectrum serialisation only handles a scalar spectrum; an
                // IQU product degrades to metadata-only with a warning.
                let cl = if combined.maps.len() == 1 {
                    Some(cl)
                } else {
                    None
                };
                cl_product = Some((cl, cl_metadata));
            }
            _ => warn!(
                "No unmasked intensity pixels for {}; skipping spectra",
                options.base_file_name
            ),
        }

        for (map, saved) in combined.maps.iter_mut().zip(saved_masks) {
            map.mask = saved;
        }
    }

    // 5: smooth the signal with the beam and the variance with the
    // pixel-error propagation rule.
    let smoothed: Vec<MaskedMap> = combined
        .maps
        .iter()
        .map(|m| {
            smoothing(&m.filled(0.0), options.fwhm).map(|values| MaskedMap {
                values,
                mask: m.mask.clone(),
            })
        })
        .collect::<Result<_, _>>()?;
    let smoothed_variance: Vec<MaskedMap> = combined_variance
        .maps
        .iter()
        .map(|m| {
            smooth_variance_map(&m.filled(0.0), options.fwhm).map(|values| MaskedMap {
                values,
                mask: m.mask.clone(),
            })
        })
        .collect::<Result<_, _>>()?;

    // 6: chi-squares, smoothed and raw.
    let single = combined.maps.len() == 1;
    for (idx, component) in combined.components.iter().enumerate() {
        let smoothed_chi2 = chisq(&smoothed[idx], &smoothed_variance[idx]);
        let raw_chi2 = chisq(&combined.maps[idx], &combined_variance.maps[idx]);
        let (smoothed_key, raw_key) = if single {
            ("map_chi2".to_string(), "map_unsm_chi2".to_string())
        } else {
            (
                format!("map_chi2_{component}"),
                format!("map_unsm_chi2_{component}"),
            )
        };
        info!(
            "{}: chi2 {raw_chi2:.4} raw, {smoothed_chi2:.4} smoothed",
            options.base_file_name
        );
        metadata = metadata
            .with_value(smoothed_key, smoothed_chi2)
            .with_value(raw_key, raw_chi2);
    }

    // 7: degrade the smoothed map for the visual product. The variance map
    // already carries its own normalisation and is not degraded further.
    let degraded: Vec<MaskedMap> = smoothed
        .iter()
        .map(|m| ud_grade(&m.filled(UNSEEN), options.degraded_nside, 0).map(MaskedMap::from_raw))
        .collect::<Result<_, _>>()?;

    metadata = metadata
        .with_base_file_name(&options.base_file_name)
        .with_value("smooth_fwhm_deg", options.fwhm.to_degrees())
        .with_value("out_nside", options.degraded_nside as f64);
    for (component, map) in combined.components.iter().zip(degraded.iter()) {
        metadata = metadata
            .with_value(format!("map_p2p_{component}"), map.peak_to_peak())
            .with_value(format!("map_std_{component}"), map.std());
    }

    // 8: persist. All computation is done; failures past this point can
    // only be I/O.
    std::fs::create_dir_all(&options.output_folder).map_err(|io_error| CombineError::Io {
        io_error,
        path: options.output_folder.display().to_string(),
    })?;

    let names: Vec<&str> = combined.components.iter().map(|c| c.column_name()).collect();
    let columns: Vec<Vec<f64>> = (0..degraded.len())
        .map(|i| degraded[i].filled(UNSEEN))
        .collect();
    write_map_columns(
        &options.product_path("map.fits"),
        &names,
        &columns,
        options.degraded_nside,
    )?;

    if let Some((cl, cl_metadata)) = cl_product {
        match cl {
            Some(cl) => write_cl(&options.product_path("cl.fits"), &cl)?,
            None => warn!(
                "Multi-component spectrum serialisation is unsupported; \
                 {} keeps its spectral metadata but no spectrum file",
                options.base_file_name
            ),
        }
        cl_metadata.write(&options.product_path("cl.json"))?;
    }

    let file_type = format!("{}_map", metadata.file_type);
    metadata
        .with_file_type(file_type)
        .write(&options.product_path("map.json"))?;
    Ok(())
}

/// Combine weighted maps read straight from files, smooth, degrade and save:
/// the ad-hoc flavour used by the `combine` subcommand, with no variance or
/// spectral bookkeeping.
pub fn smooth_and_save(
    maps_and_weights: &Vec1<(MapSet, f64)>,
    fwhm: f64,
    degraded_nside: usize,
    output: &std::path::Path,
) -> Result<(), CombineError> {
    let combined = combine_maps(maps_and_weights.as_slice())?;
    let smoothed: Vec<MaskedMap> = combined
        .maps
        .iter()
        .map(|m| {
            let values = if fwhm > 0.0 {
                smoothing(&m.filled(0.0), fwhm)?
            } else {
                m.values.clone()
            };
            Ok::<_, CombineError>(MaskedMap {
                values,
                mask: m.mask.clone(),
            })
        })
        .collect::<Result<_, _>>()?;
    let degraded: Vec<Vec<f64>> = smoothed
        .iter()
        .map(|m| ud_grade(&m.filled(UNSEEN), degraded_nside, 0))
        .collect::<Result<_, _>>()?;

    let names: Vec<&str> = combined.components.iter().map(|c| c.column_name()).collect();
    write_map_columns(output, &names, &degraded, degraded_nside)?;
    info!("Wrote {}", output.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use vec1::vec1;

    use super::*;
    use crate::sphere::nside2npix;

    fn uniform_set(nside: usize, components: Vec<Stokes>, value: f64) -> MapSet {
        let npix = nside2npix(nside);
        let maps = components
            .iter()
            .map(|_| MaskedMap::from_raw(vec![value; npix]))
            .collect();
        MapSet::new(components, maps)
    }

    #[test]
    fn test_difference_of_self_is_zero() {
        let a = uniform_set(16, vec![Stokes::I, Stokes::Q, Stokes::U], 7.25);
        let inputs = [(a.clone(), 1.0), (a, -1.0)];
        let combined = combine_maps(&inputs).unwrap();
        for map in &combined.maps {
            for &v in &map.values {
                assert_abs_diff_eq!(v, 0.0);
            }
        }
    }

    #[test]
    fn test_half_weights_combination() {
        // ones and twos at +-0.5 combine to a uniform -0.5.
        let a = uniform_set(32, vec![Stokes::I], 1.0);
        let b = uniform_set(32, vec![Stokes::I], 2.0);
        let combined = combine_maps(&[(a, 0.5), (b, -0.5)]).unwrap();
        for &v in &combined.maps[0].values {
            assert_abs_diff_eq!(v, -0.5);
        }

        // A perfectly uniform map is pure monopole; removing the fit leaves
        // nothing but floating-point noise.
        let (monopole, dipole) =
            fit_dipole(&combined.maps[0].values, &combined.maps[0].mask, 30.0).unwrap();
        assert_abs_diff_eq!(monopole, -0.5, epsilon = 1e-12);
        let mut residual = combined.maps[0].values.clone();
        remove_dipole(&mut residual, monopole, dipole);
        for &v in &residual {
            assert_abs_diff_eq!(v, 0.0, epsilon = 1e-9);
        }
    }

    #[test]
    fn test_component_count_mismatch_fails_fast() {
        let a = uniform_set(16, vec![Stokes::I, Stokes::Q, Stokes::U], 1.0);
        let b = uniform_set(16, vec![Stokes::I], 1.0);
        assert!(matches!(
            combine_maps(&[(a, 1.0), (b, -1.0)]),
            Err(CombineError::ShapeMismatch {
                expected: 3,
                actual: 1
            })
        ));
    }

    #[test]
    fn test_combination_unions_masks() {
        let mut a = uniform_set(16, vec![Stokes::I], 1.0);
        let mut b = uniform_set(16, vec![Stokes::I], 2.0);
        a.maps[0].mask[3] = true;
        b.maps[0].mask[5] = true;
        let combined = combine_maps(&[(a, 1.0), (b, -1.0)]).unwrap();
        assert!(combined.maps[0].mask[3]);
        assert!(combined.maps[0].mask[5]);
        assert!(!combined.maps[0].mask[0]);
    }

    #[test]
    fn test_chisq() {
        let signal = MaskedMap::from_raw(vec![2.0; nside2npix(4)]);
        let variance = MaskedMap::from_raw(vec![4.0; nside2npix(4)]);
        assert_abs_diff_eq!(chisq(&signal, &variance), 1.0);

        // Zero-variance pixels are skipped, not divided by.
        let mut variance = variance;
        variance.values[0] = 0.0;
        assert_abs_diff_eq!(chisq(&signal, &variance), 1.0);
    }

    #[test]
    fn test_smooth_combine_writes_products() {
        let dir = tempfile::tempdir().unwrap();
        let nside = 16;
        let npix = nside2npix(nside);

        // A smooth, low-order pattern; the numbers aren't the point here,
        // the products are.
        let values: Vec<f64> = (0..npix).map(|p| (p as f64 * 0.01).sin()).collect();
        let maps = MapSet::new(vec![Stokes::I], vec![MaskedMap::from_raw(values)]);
        let variances = MapSet::new(
            vec![Stokes::A],
            vec![MaskedMap::from_raw(vec![1.0; npix])],
        );
        let no_mask = vec![false; npix];

        let options = CombineOptions {
            fwhm: 3.0_f64.to_radians(),
            degraded_nside: 8,
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
            Metadata::default().with_file_type("halfring"),
        )
        .unwrap();

        assert!(dir.path().join("out_map.fits").exists());
        assert!(dir.path().join("out_cl.fits").exists());
        let map_meta = Metadata::read(&dir.path().join("out_map.json")).unwrap();
        assert_eq!(map_meta.file_type, "halfring_map");
        assert!(map_meta.value("map_chi2").is_some());
        assert!(map_meta.value("map_unsm_chi2").is_some());
        assert!(map_meta.value("removed_monopole_I").is_some());
        assert!(map_meta.value("map_p2p_I").is_some());
        assert_abs_diff_eq!(map_meta.value("out_nside").unwrap(), 8.0);
        let cl_meta = Metadata::read(&dir.path().join("out_cl.json")).unwrap();
        assert_eq!(cl_meta.file_type, "halfring_cl");
        assert_abs_diff_eq!(cl_meta.value("sky_fraction").unwrap(), 1.0);
        assert!(cl_meta.value("whitenoise_cl").is_some());
    }

    #[test]
    fn test_iqu_spectra_degrade_to_metadata_only() {
        let dir = tempfile::tempdir().unwrap();
        let nside = 8;
        let npix = nside2npix(nside);
        let maps = uniform_set(nside, vec![Stokes::I, Stokes::Q, Stokes::U], 1.0);
        let variances = uniform_set(nside, vec![Stokes::A, Stokes::D, Stokes::F], 1.0);
        let no_mask = vec![false; npix];

        let options = CombineOptions {
            fwhm: 5.0_f64.to_radians(),
            degraded_nside: 4,
            spectra: true,
            output_folder: dir.path().to_path_buf(),
            base_file_name: "pol".to_string(),
        };
        smooth_combine(
            &vec1![(maps, 1.0)],
            &vec1![(variances, 1.0)],
            &no_mask,
            &no_mask,
            &options,
            Metadata::default().with_file_type("surveydiff"),
        )
        .unwrap();

        // The warning path: no spectrum FITS, but the sidecar has both
        // white-noise floors.
        assert!(!dir.path().join("pol_cl.fits").exists());
        let cl_meta = Metadata::read(&dir.path().join("pol_cl.json")).unwrap();
        assert!(cl_meta.value("whitenoise_cl").is_some());
        assert!(cl_meta.value("whitenoise_cl_P").is_some());
        let map_meta = Metadata::read(&dir.path().join("pol_map.json")).unwrap();
        assert!(map_meta.value("map_chi2_Q").is_some());
        assert!(map_meta.value("map_std_U").is_some());
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! End-to-end drives over a synthetic tree-dialect archive.

use std::path::Path;

use skynull::config::{ReaderConfig, RunConfig};
use skynull::driver::{compute_union_mask, halfrings};
use skynull::io::fits::write_map_columns;
use skynull::io::metadata::Metadata;
use skynull::map::Stokes;
use skynull::reader::{reader_from_config, SurveyId};
use skynull::sphere::nside2npix;

const NSIDE: usize = 16;

/// Write a ten-column IQU map (values, hits, covariance entries) under the
/// archive layout.
fn write_archive_map(path: &Path, value: f64) {
    let npix = nside2npix(NSIDE);
    let names = [
        "TEMPERATURE",
        "Q_POLARISATION",
        "U_POLARISATION",
        "HITS",
        "II_COV",
        "IQ_COV",
        "IU_COV",
        "QQ_COV",
        "QU_COV",
        "UU_COV",
    ];
    let columns: Vec<Vec<f64>> = (0..names.len())
        .map(|i| match i {
            0 => vec![value; npix],
            1 | 2 => vec![value / 10.0; npix],
            3 => vec![100.0; npix],
            // Unit variances, tiny covariances.
            4 | 7 | 9 => vec![1.0; npix],
            _ => vec![0.0; npix],
        })
        .collect();
    write_map_columns(path, &names, &columns, NSIDE).unwrap();
}

/// A one-frequency archive with nominal half-ring jackknives, survey maps
/// and masks.
fn synthetic_archive() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    for sub in ["JackKnife", "Surveys", "MASKs"] {
        std::fs::create_dir(root.join(sub)).unwrap();
    }

    write_archive_map(
        &root.join("JackKnife/LFI_30_16_20120611_ringhalf_1_nominal.fits"),
        1.0,
    );
    write_archive_map(
        &root.join("JackKnife/LFI_30_16_20120611_ringhalf_2_nominal.fits"),
        2.0,
    );
    for survey in 1..=2 {
        write_archive_map(
            &root.join(format!("Surveys/LFI_30_16_20120611_survey_{survey}.fits")),
            survey as f64,
        );
    }

    // Masks mark valid pixels with ones.
    let npix = nside2npix(NSIDE);
    let all_valid = vec![1.0; npix];
    write_map_columns(
        &root.join("MASKs/mask_ps_30GHz_20120611.fits"),
        &["MASK"],
        &[all_valid.clone()],
        NSIDE,
    )
    .unwrap();
    write_map_columns(
        &root.join("MASKs/destripingmask_30.fits"),
        &["MASK"],
        &[all_valid],
        NSIDE,
    )
    .unwrap();
    dir
}

fn config(archive: &Path, output: &Path) -> RunConfig {
    RunConfig {
        reader: ReaderConfig::Tree {
            root: archive.to_path_buf(),
        },
        nside: NSIDE,
        smoothing_fwhm_deg: 10.0,
        degraded_nside: 8,
        compute_spectra: true,
        output_folder: output.to_path_buf(),
        frequency_list: vec![30],
        survey_list: vec![1, 2],
        run_halfrings: true,
        run_surveydiff: false,
        run_chdiff: false,
        compute_union_mask: false,
        union_extra_masks: vec![],
        parallel: false,
    }
}

#[test]
fn halfring_difference_end_to_end() {
    let archive = synthetic_archive();
    let out = tempfile::tempdir().unwrap();
    let config = config(archive.path(), out.path());
    let reader = reader_from_config(&config.reader, Some(config.nside));

    halfrings(
        reader.as_ref(),
        &config,
        30,
        "",
        SurveyId::Nominal,
        &[Stokes::I, Stokes::Q, Stokes::U],
    )
    .unwrap();

    let metadata =
        Metadata::read(&out.path().join("halfring_30_nominal_map.json")).unwrap();
    assert_eq!(metadata.file_type, "halfring_map");
    // The half rings differ by a constant 1, all of it monopole.
    let monopole = metadata.value("removed_monopole_I").unwrap();
    assert!((monopole + 1.0).abs() < 1e-6, "monopole {monopole}");
    // After removal nothing is left, so the map statistics are tiny.
    let std_i = metadata.value("map_std_I").unwrap();
    assert!(std_i < 1e-6, "std {std_i}");
    assert!(out.path().join("halfring_30_nominal_map.fits").exists());

    // IQU spectra cannot be serialised; the sidecar must still exist with
    // both white-noise floors.
    assert!(!out.path().join("halfring_30_nominal_cl.fits").exists());
    let cl_metadata =
        Metadata::read(&out.path().join("halfring_30_nominal_cl.json")).unwrap();
    assert!(cl_metadata.value("whitenoise_cl").unwrap() > 0.0);
    assert!(cl_metadata.value("whitenoise_cl_P").unwrap() > 0.0);
}

#[test]
fn union_mask_end_to_end() {
    let archive = synthetic_archive();
    let out = tempfile::tempdir().unwrap();
    let config = config(archive.path(), out.path());
    let reader = reader_from_config(&config.reader, Some(config.nside));

    let path = compute_union_mask(reader.as_ref(), &config, 30).unwrap();
    assert!(path.ends_with("union_mask_30.fits"));
    let mask = skynull::io::fits::read_map_columns(&path, &[0]).unwrap();
    // Fully valid inputs union to a fully empty exclusion mask.
    assert!(mask[0].iter().all(|&v| v == 0.0));
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Enumerating and running the null-test comparisons.
//!
//! Three families of comparison exist: half-ring differences, survey-pair
//! differences and channel-pair differences. Every comparison is
//! independent of every other (own inputs, own outputs), so the batch is
//! embarrassingly parallel and one comparison's failure is logged and
//! skipped, never propagated.

use std::fmt;
use std::path::PathBuf;

use indicatif::{ParallelProgressIterator, ProgressIterator};
use itertools::Itertools;
use log::{error, info, warn};
use rayon::prelude::*;
use thiserror::Error;
use vec1::vec1;

use crate::combine::{smooth_combine, CombineError, CombineOptions};
use crate::config::RunConfig;
use crate::constants::{channel_list, horns, QUADRUPLETS_70};
use crate::io::metadata::Metadata;
use crate::map::Stokes;
use crate::mask::{or_into, read_mask, to_map, MaskError};
use crate::reader::{reader_from_config, MapReader, MapSelector, ReaderError, SurveyId};
use crate::sphere::map_nside;

#[derive(Error, Debug)]
pub enum DriverError {
    #[error(transparent)]
    Reader(#[from] ReaderError),

    #[error(transparent)]
    Combine(#[from] CombineError),

    #[error(transparent)]
    Mask(#[from] MaskError),

    #[error("Component {0} has no matching variance column")]
    NoVariancePartner(Stokes),

    #[error("Couldn't create the output folder {path}: {io_error}")]
    Io {
        io_error: std::io::Error,
        path: String,
    },
}

/// One independently runnable unit of the batch.
#[derive(Debug, Clone)]
pub enum Task {
    HalfRings {
        frequency: u32,
        channel_tag: String,
        survey: SurveyId,
        components: Vec<Stokes>,
    },
    SurveyDiff {
        frequency: u32,
        channel_tag: String,
        components: Vec<Stokes>,
        bandpass_corrected: bool,
    },
    ChDiff {
        frequency: u32,
        survey: u8,
    },
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Task::HalfRings {
                frequency,
                channel_tag,
                survey,
                ..
            } => write!(f, "halfrings {frequency}GHz '{channel_tag}' {survey}"),
            Task::SurveyDiff {
                frequency,
                channel_tag,
                bandpass_corrected,
                ..
            } => write!(
                f,
                "surveydiff {frequency}GHz '{channel_tag}'{}",
                if *bandpass_corrected { " bp_corr" } else { "" }
            ),
            Task::ChDiff { frequency, survey } => {
                write!(f, "chdiff {frequency}GHz survey {survey}")
            }
        }
    }
}

/// Canonical order of a survey pair: when exactly one member is odd it goes
/// first, otherwise ascending.
pub fn canonicalize_survey_pair(a: u8, b: u8) -> (u8, u8) {
    match (a % 2 == 1, b % 2 == 1) {
        (true, false) => (a, b),
        (false, true) => (b, a),
        _ => (a.min(b), a.max(b)),
    }
}

/// The variance components matching a set of value components.
fn variance_components(components: &[Stokes]) -> Result<Vec<Stokes>, DriverError> {
    components
        .iter()
        .map(|&c| c.variance_partner().ok_or(DriverError::NoVariancePartner(c)))
        .collect()
}

fn combine_options(config: &RunConfig, base_file_name: String) -> CombineOptions {
    CombineOptions {
        fwhm: config.smoothing_fwhm_deg.to_radians(),
        degraded_nside: config.degraded_nside,
        spectra: config.compute_spectra,
        output_folder: config.output_folder.clone(),
        base_file_name,
    }
}

fn tag_suffix(channel_tag: &str) -> String {
    if channel_tag.is_empty() {
        String::new()
    } else {
        format!("_{channel_tag}")
    }
}

/// Difference of the two half rings of one scan, weights +1/-1.
pub fn halfrings(
    reader: &dyn MapReader,
    config: &RunConfig,
    frequency: u32,
    channel_tag: &str,
    survey: SurveyId,
    components: &[Stokes],
) -> Result<(), DriverError> {
    let (ps_mask, spectra_mask) = reader.read_masks(frequency)?;
    let variance = variance_components(components)?;

    let value_selector = |half_ring| {
        MapSelector::new(
            frequency,
            survey,
            channel_tag,
            half_ring,
            components.to_vec(),
        )
    };
    let variance_selector = |half_ring| {
        MapSelector::new(frequency, survey, channel_tag, half_ring, variance.clone())
    };

    let maps = vec1![
        (reader.read(&value_selector(1))?, 1.0),
        (reader.read(&value_selector(2))?, -1.0),
    ];
    // Variances add: the weights stay positive for a difference.
    let variances = vec1![
        (reader.read(&variance_selector(1))?, 1.0),
        (reader.read(&variance_selector(2))?, 1.0),
    ];

    let base = format!("halfring_{frequency}{}_{survey}", tag_suffix(channel_tag));
    let metadata = Metadata::default()
        .with_title(format!(
            "Half-ring difference {frequency}GHz {channel_tag} {survey}"
        ))
        .with_channel(if channel_tag.is_empty() {
            frequency.to_string()
        } else {
            channel_tag.to_string()
        })
        .with_survey(survey.to_string())
        .with_file_type("halfring");

    smooth_combine(
        &maps,
        &variances,
        &ps_mask,
        &spectra_mask,
        &combine_options(config, base),
        metadata,
    )?;
    Ok(())
}

/// Differences of every canonical pair of surveys, weights +1/-1. All maps
/// for the survey list are read once, then each pair combines.
pub fn surveydiff(
    reader: &dyn MapReader,
    config: &RunConfig,
    frequency: u32,
    channel_tag: &str,
    components: &[Stokes],
    bandpass_corrected: bool,
) -> Result<(), DriverError> {
    let (ps_mask, spectra_mask) = reader.read_masks(frequency)?;
    let variance = variance_components(components)?;

    let mut sets = vec![];
    for &survey in &config.survey_list {
        let value = reader.read(
            &MapSelector::new(
                frequency,
                SurveyId::Survey(survey),
                channel_tag,
                0,
                components.to_vec(),
            )
            .with_bandpass_correction(bandpass_corrected),
        )?;
        let var = reader.read(&MapSelector::new(
            frequency,
            SurveyId::Survey(survey),
            channel_tag,
            0,
            variance.clone(),
        ))?;
        sets.push((survey, value, var));
    }

    for pair in sets.iter().combinations(2) {
        let (first, second) = canonicalize_survey_pair(pair[0].0, pair[1].0);
        let lookup = |s: u8| sets.iter().find(|(n, _, _)| *n == s).unwrap();
        let (_, value_a, var_a) = lookup(first);
        let (_, value_b, var_b) = lookup(second);

        let suffix = tag_suffix(channel_tag);
        let corr = if bandpass_corrected { "_bpcorr" } else { "" };
        let base = format!("surveydiff_{frequency}{suffix}_SS{first}-SS{second}{corr}");
        let metadata = Metadata::default()
            .with_title(format!(
                "Survey difference {frequency}GHz {channel_tag} SS{first} - SS{second}"
            ))
            .with_channel(if channel_tag.is_empty() {
                frequency.to_string()
            } else {
                channel_tag.to_string()
            })
            .with_survey(format!("SS{first}-SS{second}"))
            .with_file_type("surveydiff");

        let result = smooth_combine(
            &vec1![(value_a.clone(), 1.0), (value_b.clone(), -1.0)],
            &vec1![(var_a.clone(), 1.0), (var_b.clone(), 1.0)],
            &ps_mask,
            &spectra_mask,
            &combine_options(config, base.clone()),
            metadata,
        );
        if let Err(e) = result {
            error!("{base}: {e}");
        }
    }
    Ok(())
}

/// Differences of every pair of horns at one frequency for one survey,
/// intensity only, weights +1/-1.
pub fn chdiff(
    reader: &dyn MapReader,
    config: &RunConfig,
    frequency: u32,
    channels: &[String],
    survey: u8,
) -> Result<(), DriverError> {
    let (ps_mask, spectra_mask) = reader.read_masks(frequency)?;

    let mut sets = vec![];
    for channel in channels {
        let value = reader.read(&MapSelector::new(
            frequency,
            SurveyId::Survey(survey),
            channel.as_str(),
            0,
            vec![Stokes::I],
        ))?;
        let var = reader.read(&MapSelector::new(
            frequency,
            SurveyId::Survey(survey),
            channel.as_str(),
            0,
            vec![Stokes::A],
        ))?;
        sets.push((channel.clone(), value, var));
    }

    for pair in sets.iter().combinations(2) {
        let (ch_a, value_a, var_a) = pair[0];
        let (ch_b, value_b, var_b) = pair[1];
        let base = format!("chdiff_{frequency}_{ch_a}-{ch_b}_SS{survey}");
        let metadata = Metadata::default()
            .with_title(format!("Channel difference {ch_a} - {ch_b} SS{survey}"))
            .with_channel(format!("{ch_a}-{ch_b}"))
            .with_survey(format!("survey_{survey}"))
            .with_file_type("chdiff");

        let result = smooth_combine(
            &vec1![(value_a.clone(), 1.0), (value_b.clone(), -1.0)],
            &vec1![(var_a.clone(), 1.0), (var_b.clone(), 1.0)],
            &ps_mask,
            &spectra_mask,
            &combine_options(config, base.clone()),
            metadata,
        );
        if let Err(e) = result {
            error!("{base}: {e}");
        }
    }
    Ok(())
}

/// The channel tags enumerated for a frequency: the full-frequency map plus
/// the 70 GHz quadruplets.
fn frequency_tags(frequency: u32) -> Vec<String> {
    let mut tags = vec![String::new()];
    if frequency == 70 {
        tags.extend(QUADRUPLETS_70.iter().map(|t| t.to_string()));
    }
    tags
}

/// Expand the run configuration into the full comparison batch.
pub fn enumerate_tasks(config: &RunConfig) -> Vec<Task> {
    let mut tasks = vec![];

    if config.run_halfrings {
        for &frequency in &config.frequency_list {
            for channel_tag in frequency_tags(frequency) {
                for survey in [SurveyId::Nominal, SurveyId::Full] {
                    tasks.push(Task::HalfRings {
                        frequency,
                        channel_tag: channel_tag.clone(),
                        survey,
                        components: vec![Stokes::I, Stokes::Q, Stokes::U],
                    });
                }
            }
        }
    }

    if config.run_surveydiff {
        for bandpass_corrected in [false, true] {
            for &frequency in &config.frequency_list {
                let mut tags = frequency_tags(frequency);
                tags.extend(channel_list(frequency));
                for channel_tag in tags {
                    // The correction maps only exist per frequency/detset.
                    if bandpass_corrected && !channel_tag.is_empty() {
                        continue;
                    }
                    // Single radiometers are unpolarised on their own.
                    let components =
                        if !channel_tag.is_empty() && !channel_tag.contains('_') {
                            vec![Stokes::I]
                        } else {
                            vec![Stokes::I, Stokes::Q, Stokes::U]
                        };
                    tasks.push(Task::SurveyDiff {
                        frequency,
                        channel_tag,
                        components,
                        bandpass_corrected,
                    });
                }
            }
        }
    }

    if config.run_chdiff {
        for &frequency in &config.frequency_list {
            for &survey in &config.survey_list {
                tasks.push(Task::ChDiff { frequency, survey });
            }
        }
    }

    tasks
}

fn run_task(reader: &dyn MapReader, config: &RunConfig, task: &Task) -> Result<(), DriverError> {
    match task {
        Task::HalfRings {
            frequency,
            channel_tag,
            survey,
            components,
        } => halfrings(reader, config, *frequency, channel_tag, *survey, components),
        Task::SurveyDiff {
            frequency,
            channel_tag,
            components,
            bandpass_corrected,
        } => surveydiff(
            reader,
            config,
            *frequency,
            channel_tag,
            components,
            *bandpass_corrected,
        ),
        Task::ChDiff { frequency, survey } => {
            let channels: Vec<String> = horns(*frequency)
                .unwrap_or(&[])
                .iter()
                .map(|h| format!("LFI{h}"))
                .collect();
            chdiff(reader, config, *frequency, &channels, *survey)
        }
    }
}

/// The union of the spectra (destriping) mask, any configured extra masks
/// and the Q exclusion mask of every enumerated map at this frequency.
pub fn compute_union_mask(
    reader: &dyn MapReader,
    config: &RunConfig,
    frequency: u32,
) -> Result<PathBuf, DriverError> {
    let (_, mut union) = reader.read_masks(frequency)?;
    let nside = match reader.analysis_nside() {
        Some(nside) => nside,
        None => map_nside(&to_map(&union)).map_err(MaskError::Sphere)?,
    };
    for path in &config.union_extra_masks {
        or_into(&mut union, &read_mask(path, Some(nside))?);
    }
    for &survey in &config.survey_list {
        for channel_tag in frequency_tags(frequency) {
            let selector = MapSelector::new(
                frequency,
                SurveyId::Survey(survey),
                channel_tag,
                0,
                vec![Stokes::Q],
            );
            let set = reader.read(&selector)?;
            if let Some(q) = set.get(Stokes::Q) {
                or_into(&mut union, &q.mask);
            }
        }
    }

    std::fs::create_dir_all(&config.output_folder).map_err(|io_error| DriverError::Io {
        io_error,
        path: config.output_folder.display().to_string(),
    })?;
    let path = config.output_folder.join(format!("union_mask_{frequency}.fits"));
    crate::io::fits::write_map_columns(&path, &["MASK"], &[to_map(&union)], nside)
        .map_err(CombineError::Fits)?;
    info!("Wrote {}", path.display());
    Ok(path)
}

/// Run the configured batch. With `dry_run`, only resolve and print the
/// files each comparison would read.
pub fn run(config: &RunConfig, dry_run: bool) -> Result<(), DriverError> {
    let reader = reader_from_config(&config.reader, Some(config.nside));
    let tasks = enumerate_tasks(config);
    info!("{} comparisons to run", tasks.len());

    if dry_run {
        for task in &tasks {
            for selector in task_selectors(task, config) {
                match reader.resolve_paths(&selector) {
                    Ok(paths) => {
                        for path in paths {
                            info!("{task}: {}", path.display());
                        }
                    }
                    Err(e) => warn!("{task}: {e}"),
                }
            }
        }
        return Ok(());
    }

    std::fs::create_dir_all(&config.output_folder).map_err(|io_error| DriverError::Io {
        io_error,
        path: config.output_folder.display().to_string(),
    })?;

    // Comparisons are independent; failures are contained to their task.
    let run_one = |task: &Task| {
        if let Err(e) = run_task(reader.as_ref(), config, task) {
            error!("{task}: {e}");
        }
    };
    let count = tasks.len() as u64;
    if config.parallel {
        tasks.par_iter().progress_count(count).for_each(run_one);
    } else {
        tasks.iter().progress_count(count).for_each(run_one);
    }

    if config.compute_union_mask {
        for &frequency in &config.frequency_list {
            if let Err(e) = compute_union_mask(reader.as_ref(), config, frequency) {
                error!("union mask {frequency}GHz: {e}");
            }
        }
    }
    Ok(())
}

/// The value-map selectors a task will read; used by dry runs.
fn task_selectors(task: &Task, config: &RunConfig) -> Vec<MapSelector> {
    match task {
        Task::HalfRings {
            frequency,
            channel_tag,
            survey,
            components,
        } => [1, 2]
            .into_iter()
            .map(|half_ring| {
                MapSelector::new(
                    *frequency,
                    *survey,
                    channel_tag.clone(),
                    half_ring,
                    components.clone(),
                )
            })
            .collect(),
        Task::SurveyDiff {
            frequency,
            channel_tag,
            components,
            bandpass_corrected,
        } => config
            .survey_list
            .iter()
            .map(|&survey| {
                MapSelector::new(
                    *frequency,
                    SurveyId::Survey(survey),
                    channel_tag.clone(),
                    0,
                    components.clone(),
                )
                .with_bandpass_correction(*bandpass_corrected)
            })
            .collect(),
        Task::ChDiff { frequency, survey } => horns(*frequency)
            .unwrap_or(&[])
            .iter()
            .map(|h| {
                MapSelector::new(
                    *frequency,
                    SurveyId::Survey(*survey),
                    format!("LFI{h}"),
                    0,
                    vec![Stokes::I],
                )
            })
            .collect(),
    }
}

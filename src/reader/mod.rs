// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Resolving map selectors to files and reading them.
//!
//! A [MapSelector] names a logical sky map (frequency, survey, channel set,
//! half ring, components); the [MapReader] capability turns it into pixels.
//! Two file-layout dialects implement the same contract and share the
//! classification and token logic here, so the decision tree over naming
//! conventions exists exactly once.

mod error;
mod flat;
mod tree;

pub use error::ReaderError;
pub use flat::FlatDialect;
pub use tree::TreeDialect;

use std::fmt;
use std::path::PathBuf;

use lazy_static::lazy_static;
use log::{debug, info};
use regex::Regex;
use strum_macros::Display;

use crate::config::ReaderConfig;
use crate::constants::LFI_MAX_FREQ;
use crate::io::fits::read_map_columns;
use crate::map::{MapSet, MaskedMap, Stokes};
use crate::mask::{read_mask, Mask};
use crate::sphere::{is_bad, map_nside, ud_grade};

lazy_static! {
    // An LFI horn id: "LFI" plus the two-digit horn number, no arm letter.
    static ref RE_HORN: Regex = Regex::new(r"^LFI\d{2}$").unwrap();
}

/// Which set of detectors a channel tag selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChannelSetKind {
    /// The full frequency map (empty tag).
    Frequency,
    /// A named detector subset, e.g. "18_23" or "detset_1".
    Detset,
    /// A single radiometer, e.g. "LFI18S".
    SingleChannel,
    /// Both radiometers of one horn, e.g. "LFI18"; read as the average of
    /// the two arms.
    Horn,
}

/// Classify a channel tag. Total and pure: every string maps to a kind.
pub fn classify(channel_tag: &str) -> ChannelSetKind {
    if channel_tag.is_empty() {
        ChannelSetKind::Frequency
    } else if channel_tag.contains('_') {
        ChannelSetKind::Detset
    } else if RE_HORN.is_match(channel_tag) {
        ChannelSetKind::Horn
    } else {
        ChannelSetKind::SingleChannel
    }
}

/// An observation epoch selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SurveyId {
    Nominal,
    Full,
    Survey(u8),
}

impl SurveyId {
    pub fn is_numbered(self) -> bool {
        matches!(self, SurveyId::Survey(_))
    }

    /// The bare token substituted into flat-dialect filename templates.
    pub fn token(self) -> String {
        match self {
            SurveyId::Nominal => "nominal".to_string(),
            SurveyId::Full => "full".to_string(),
            SurveyId::Survey(n) => n.to_string(),
        }
    }
}

impl fmt::Display for SurveyId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SurveyId::Nominal => write!(f, "nominal"),
            SurveyId::Full => write!(f, "full"),
            SurveyId::Survey(n) => write!(f, "survey_{n}"),
        }
    }
}

/// Identifies one logical sky map to read.
#[derive(Debug, Clone)]
pub struct MapSelector {
    pub frequency: u32,
    pub survey: SurveyId,
    /// "" (frequency map), a detset/quadruplet tag, a horn id or a single
    /// radiometer id.
    pub channel_tag: String,
    /// 0 for the full scan, 1 or 2 for a half ring.
    pub half_ring: u8,
    pub components: Vec<Stokes>,
    pub bandpass_corrected: bool,
}

impl MapSelector {
    pub fn new(
        frequency: u32,
        survey: SurveyId,
        channel_tag: impl Into<String>,
        half_ring: u8,
        components: Vec<Stokes>,
    ) -> MapSelector {
        MapSelector {
            frequency,
            survey,
            channel_tag: channel_tag.into(),
            half_ring,
            components,
            bandpass_corrected: false,
        }
    }

    pub fn with_bandpass_correction(mut self, bandpass_corrected: bool) -> MapSelector {
        self.bandpass_corrected = bandpass_corrected;
        self
    }

    pub fn kind(&self) -> ChannelSetKind {
        classify(&self.channel_tag)
    }

    fn validate(&self) -> Result<(), ReaderError> {
        if self.half_ring > 2 {
            return Err(ReaderError::InvalidSelector {
                reason: format!("half_ring {} is not 0, 1 or 2", self.half_ring),
            });
        }
        if self.components.is_empty() {
            return Err(ReaderError::InvalidSelector {
                reason: "no components requested".to_string(),
            });
        }
        Ok(())
    }
}

// Single-channel and horn maps carry intensity, hits and the II variance
// only; everything else carries the full component alphabet.
const STOKES_IQU: [Stokes; 10] = [
    Stokes::I,
    Stokes::Q,
    Stokes::U,
    Stokes::H,
    Stokes::A,
    Stokes::B,
    Stokes::C,
    Stokes::D,
    Stokes::E,
    Stokes::F,
];
const STOKES_I: [Stokes; 3] = [Stokes::I, Stokes::H, Stokes::A];

fn component_alphabet(kind: ChannelSetKind) -> &'static [Stokes] {
    match kind {
        ChannelSetKind::SingleChannel | ChannelSetKind::Horn => &STOKES_I,
        _ => &STOKES_IQU,
    }
}

/// The file-column position of each requested component.
fn component_columns(selector: &MapSelector) -> Result<Vec<usize>, ReaderError> {
    let kind = selector.kind();
    let alphabet = component_alphabet(kind);
    selector
        .components
        .iter()
        .map(|&component| {
            alphabet
                .iter()
                .position(|&a| a == component)
                .ok_or(ReaderError::UnsupportedComponent { component, kind })
        })
        .collect()
}

/// The frequency and channel tokens substituted into filename patterns.
/// High-frequency detectors embed the channel name in the frequency slot;
/// low-frequency radiometer tags drop their "LFI" prefix.
fn channel_tokens(selector: &MapSelector) -> (String, String) {
    match selector.kind() {
        ChannelSetKind::Frequency => (selector.frequency.to_string(), String::new()),
        ChannelSetKind::Detset => (selector.frequency.to_string(), selector.channel_tag.clone()),
        ChannelSetKind::SingleChannel | ChannelSetKind::Horn => {
            if selector.frequency > LFI_MAX_FREQ {
                (selector.channel_tag.clone(), String::new())
            } else {
                (
                    selector.frequency.to_string(),
                    selector
                        .channel_tag
                        .trim_start_matches("LFI")
                        .to_string(),
                )
            }
        }
    }
}

/// The two radiometer arms of a horn.
fn horn_arm_tags(frequency: u32, channel_tag: &str) -> [String; 2] {
    if frequency > LFI_MAX_FREQ {
        [format!("{channel_tag}a"), format!("{channel_tag}b")]
    } else {
        [format!("{channel_tag}M"), format!("{channel_tag}S")]
    }
}

/// What a file-layout dialect must know how to locate. Horn selectors never
/// reach a dialect; they are expanded into their arms first.
pub trait Dialect: Send + Sync {
    fn map_path(&self, selector: &MapSelector) -> Result<PathBuf, ReaderError>;

    fn bandpass_path(&self, frequency: u32, survey: SurveyId) -> Result<PathBuf, ReaderError>;

    /// The point-source mask and the (stricter) spectra mask.
    fn mask_paths(&self, frequency: u32) -> Result<(PathBuf, PathBuf), ReaderError>;
}

/// The map-reading capability the rest of the pipeline consumes.
pub trait MapReader: Send + Sync {
    /// Read the selected map, one [MaskedMap] per requested component.
    fn read(&self, selector: &MapSelector) -> Result<MapSet, ReaderError>;

    /// Resolve the files backing a selector without reading pixels.
    fn resolve_paths(&self, selector: &MapSelector) -> Result<Vec<PathBuf>, ReaderError>;

    /// Read the point-source and spectra masks for a frequency.
    fn read_masks(&self, frequency: u32) -> Result<(Mask, Mask), ReaderError>;

    /// The resolution maps are harmonised to on read, if any.
    fn analysis_nside(&self) -> Option<usize>;
}

/// A [MapReader] over any file-layout dialect.
pub struct Reader<D> {
    dialect: D,
    nside: Option<usize>,
}

impl<D: Dialect> Reader<D> {
    pub fn new(dialect: D, nside: Option<usize>) -> Reader<D> {
        Reader { dialect, nside }
    }

    /// Expand a selector into the weighted sub-reads backing it: a horn is
    /// the 0.5/0.5 average of its two arms (a fixed rule, not a general
    /// weighted sum); anything else is itself.
    fn expand(&self, selector: &MapSelector) -> Vec<(MapSelector, f64)> {
        match selector.kind() {
            ChannelSetKind::Horn => horn_arm_tags(selector.frequency, &selector.channel_tag)
                .into_iter()
                .map(|arm| {
                    let mut sub = selector.clone();
                    sub.channel_tag = arm;
                    sub.bandpass_corrected = false;
                    (sub, 0.5)
                })
                .collect(),
            _ => vec![(selector.clone(), 1.0)],
        }
    }
}

impl<D: Dialect> MapReader for Reader<D> {
    fn read(&self, selector: &MapSelector) -> Result<MapSet, ReaderError> {
        selector.validate()?;
        let columns = component_columns(selector)?;

        // Accumulate the weighted sub-reads component by component.
        let mut combined: Option<Vec<Vec<f64>>> = None;
        for (sub, weight) in self.expand(selector) {
            let path = self.dialect.map_path(&sub)?;
            info!("Reading {}", path.display());
            let pixels = read_map_columns(&path, &columns)?;
            combined = Some(match combined {
                None => pixels
                    .into_iter()
                    .map(|column| {
                        column
                            .iter()
                            .map(|&v| if is_bad(v) { f64::NAN } else { v * weight })
                            .collect()
                    })
                    .collect(),
                Some(mut acc) => {
                    for (acc_column, column) in acc.iter_mut().zip(pixels.into_iter()) {
                        for (a, &v) in acc_column.iter_mut().zip(column.iter()) {
                            *a += if is_bad(v) { f64::NAN } else { v * weight };
                        }
                    }
                    acc
                }
            });
        }
        let mut maps: Vec<MaskedMap> = combined
            .unwrap_or_default()
            .into_iter()
            .map(MaskedMap::from_raw)
            .collect();

        if selector.bandpass_corrected {
            let path = self.dialect.bandpass_path(selector.frequency, selector.survey)?;
            info!("Applying the bandpass correction {}", path.display());
            let correction = read_map_columns(&path, &[0, 1, 2])?;
            for (component, map) in selector.components.iter().zip(maps.iter_mut()) {
                let idx = match component {
                    Stokes::I => 0,
                    Stokes::Q => 1,
                    Stokes::U => 2,
                    _ => continue,
                };
                for ((v, &m), &c) in map
                    .values
                    .iter_mut()
                    .zip(map.mask.iter())
                    .zip(correction[idx].iter())
                {
                    if !m && !is_bad(c) {
                        *v += c;
                    }
                }
            }
        }

        if let Some(nside) = self.nside {
            let native = maps
                .first()
                .map(|m| map_nside(&m.values))
                .transpose()?
                .unwrap_or(nside);
            if native != nside {
                debug!("Downgrading from nside {native} to {nside}");
                maps = selector
                    .components
                    .iter()
                    .zip(maps.iter())
                    .map(|(component, map)| {
                        let power = if component.is_variance() { 2 } else { 0 };
                        ud_grade(&map.filled(crate::constants::UNSEEN), nside, power)
                            .map(MaskedMap::from_raw)
                    })
                    .collect::<Result<_, _>>()?;
            }
        }

        Ok(MapSet::new(selector.components.clone(), maps))
    }

    fn resolve_paths(&self, selector: &MapSelector) -> Result<Vec<PathBuf>, ReaderError> {
        selector.validate()?;
        component_columns(selector)?;
        let mut paths = vec![];
        for (sub, _) in self.expand(selector) {
            paths.push(self.dialect.map_path(&sub)?);
        }
        if selector.bandpass_corrected {
            paths.push(
                self.dialect
                    .bandpass_path(selector.frequency, selector.survey)?,
            );
        }
        Ok(paths)
    }

    fn read_masks(&self, frequency: u32) -> Result<(Mask, Mask), ReaderError> {
        let (ps_path, spectra_path) = self.dialect.mask_paths(frequency)?;
        let ps = read_mask(&ps_path, self.nside)?;
        let spectra = read_mask(&spectra_path, self.nside)?;
        Ok((ps, spectra))
    }

    fn analysis_nside(&self) -> Option<usize> {
        self.nside
    }
}

/// Build the configured reader dialect.
pub fn reader_from_config(config: &ReaderConfig, nside: Option<usize>) -> Box<dyn MapReader> {
    match config {
        ReaderConfig::Flat { root, templates } => Box::new(Reader::new(
            FlatDialect::new(root.clone(), templates.clone()),
            nside,
        )),
        ReaderConfig::Tree { root } => Box::new(Reader::new(TreeDialect::new(root.clone()), nside)),
    }
}

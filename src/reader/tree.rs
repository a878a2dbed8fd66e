// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The categorised-subfolder dialect of the map archive.
//!
//! Products are segregated by kind: full-frequency survey maps under
//! `Surveys/`, half-ring jackknives under `JackKnife/`, horn quadruplets
//! under `Couple_horn/`, single radiometers under `Single_Radiometer/`,
//! bandpass corrections under `bandpass_correction/` and masks under
//! `MASKs/`. Filenames keep every reprocessing run; the lexicographically
//! last match (the most recent run id) wins.

use std::path::PathBuf;

use super::{channel_tokens, ChannelSetKind, Dialect, MapSelector, ReaderError, SurveyId};
use crate::io::{get_last_match_from_glob, GlobError};

pub struct TreeDialect {
    root: PathBuf,
}

impl TreeDialect {
    pub fn new(root: PathBuf) -> TreeDialect {
        TreeDialect { root }
    }

    fn resolve_last(&self, subdir: &str, name: String) -> Result<PathBuf, ReaderError> {
        let pattern = if subdir.is_empty() {
            self.root.join(name)
        } else {
            self.root.join(subdir).join(name)
        };
        let pattern = pattern.to_string_lossy().into_owned();
        match get_last_match_from_glob(&pattern) {
            Ok(path) => Ok(path),
            Err(GlobError::NoMatches { .. }) => Err(ReaderError::NotFound { pattern }),
            Err(e) => Err(e.into()),
        }
    }
}

fn survey_token(survey: SurveyId) -> String {
    match survey {
        SurveyId::Nominal => "nominal".to_string(),
        SurveyId::Full => "full".to_string(),
        SurveyId::Survey(n) => format!("survey_{n}"),
    }
}

fn halfring_token(half_ring: u8) -> String {
    if half_ring == 0 {
        String::new()
    } else {
        format!("ringhalf_{half_ring}_")
    }
}

impl Dialect for TreeDialect {
    fn map_path(&self, selector: &MapSelector) -> Result<PathBuf, ReaderError> {
        let (frequency, tag) = channel_tokens(selector);
        let survey = survey_token(selector.survey);
        let halfring = halfring_token(selector.half_ring);

        let (subdir, name) = match selector.kind() {
            ChannelSetKind::Frequency => {
                let subdir = if selector.half_ring != 0 {
                    "JackKnife"
                } else if selector.survey.is_numbered() {
                    "Surveys"
                } else {
                    ""
                };
                (
                    subdir,
                    format!("LFI_{frequency}_*_????????_{halfring}{survey}.fits"),
                )
            }
            ChannelSetKind::SingleChannel | ChannelSetKind::Horn => (
                "Single_Radiometer",
                format!("LFI_{frequency}_*_????????_{tag}_{halfring}{survey}.fits"),
            ),
            ChannelSetKind::Detset => {
                let subdir = if selector.half_ring != 0 {
                    "JackKnife"
                } else {
                    "Couple_horn"
                };
                (
                    subdir,
                    format!("LFI_{frequency}_*_????????_{tag}_{halfring}{survey}.fits"),
                )
            }
        };
        self.resolve_last(subdir, name)
    }

    fn bandpass_path(&self, frequency: u32, survey: SurveyId) -> Result<PathBuf, ReaderError> {
        let survey = match survey {
            SurveyId::Nominal => "nominalsurvey".to_string(),
            SurveyId::Full => "fullsurvey".to_string(),
            SurveyId::Survey(n) => format!("ss{n}"),
        };
        self.resolve_last(
            "bandpass_correction",
            format!("iqu_bandpass_correction_{frequency}_{survey}.fits"),
        )
    }

    fn mask_paths(&self, frequency: u32) -> Result<(PathBuf, PathBuf), ReaderError> {
        let ps = self.resolve_last("MASKs", format!("mask_ps_{frequency}GHz_*.fits"))?;
        let spectra = self.resolve_last("MASKs", format!("destripingmask_{frequency}.fits"))?;
        Ok((ps, spectra))
    }
}

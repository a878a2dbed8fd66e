// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The flat file-layout dialect: every product in one directory, filename
//! patterns supplied by the reader configuration.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use super::{channel_tokens, ChannelSetKind, Dialect, MapSelector, ReaderError, SurveyId};
use crate::io::{get_single_match_from_glob, GlobError};

pub struct FlatDialect {
    root: PathBuf,
    templates: BTreeMap<String, String>,
}

impl FlatDialect {
    pub fn new(root: PathBuf, templates: BTreeMap<String, String>) -> FlatDialect {
        FlatDialect { root, templates }
    }

    fn template(&self, key: &str) -> Result<&str, ReaderError> {
        self.templates
            .get(key)
            .map(|s| s.as_str())
            .ok_or_else(|| ReaderError::MissingTemplate {
                key: key.to_string(),
            })
    }

    /// Substitute `{name}` placeholders.
    fn fill(template: &str, values: &[(&str, &str)]) -> String {
        let mut out = template.to_string();
        for (name, value) in values {
            out = out.replace(&format!("{{{name}}}"), value);
        }
        out
    }

    /// Resolve a pattern to exactly one file. Full-mission maps sometimes
    /// drop their `_full` token, so that variant is tried before giving up.
    fn resolve(&self, pattern: &Path) -> Result<PathBuf, ReaderError> {
        let pattern = pattern.to_string_lossy().into_owned();
        for candidate in [pattern.clone(), pattern.replace("_full", "")] {
            match get_single_match_from_glob(&candidate) {
                Ok(path) => return Ok(path),
                Err(GlobError::NoMatches { .. }) => continue,
                Err(GlobError::MoreThanOneMatch { .. }) => {
                    return Err(ReaderError::Ambiguous { pattern: candidate })
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(ReaderError::NotFound { pattern })
    }
}

impl Dialect for FlatDialect {
    fn map_path(&self, selector: &MapSelector) -> Result<PathBuf, ReaderError> {
        let mut parts = vec![
            "map",
            match selector.kind() {
                ChannelSetKind::Frequency => "frequency",
                ChannelSetKind::Detset => "detset",
                // Horn selectors were expanded into single channels upstream.
                ChannelSetKind::SingleChannel | ChannelSetKind::Horn => "channel",
            },
        ];
        if selector.survey.is_numbered() {
            parts.push("survey");
        }
        if selector.half_ring != 0 {
            parts.push("halfring");
        }
        let key = parts.join("_");
        let template = self.template(&key)?;

        let (frequency, channel) = channel_tokens(selector);
        let survey = selector.survey.token();
        let halfring = selector.half_ring.to_string();
        let name = Self::fill(
            template,
            &[
                ("frequency", frequency.as_str()),
                ("channel", channel.as_str()),
                ("survey", survey.as_str()),
                ("halfring", halfring.as_str()),
            ],
        );
        self.resolve(&self.root.join(name))
    }

    fn bandpass_path(&self, frequency: u32, survey: SurveyId) -> Result<PathBuf, ReaderError> {
        let key = if survey.is_numbered() {
            "map_iqucorrection_survey"
        } else {
            "map_iqucorrection"
        };
        let template = self.template(key)?;
        let frequency = frequency.to_string();
        let survey = survey.token();
        let name = Self::fill(
            template,
            &[
                ("frequency", frequency.as_str()),
                ("survey", survey.as_str()),
            ],
        );
        self.resolve(&self.root.join(name))
    }

    fn mask_paths(&self, frequency: u32) -> Result<(PathBuf, PathBuf), ReaderError> {
        let frequency = frequency.to_string();
        let mut paths = vec![];
        for key in ["ps_mask", "spectra_mask"] {
            let template = self.template(key)?;
            let name = Self::fill(template, &[("frequency", frequency.as_str())]);
            paths.push(self.resolve(&self.root.join(name))?);
        }
        let spectra = paths.pop().unwrap();
        let ps = paths.pop().unwrap();
        Ok((ps, spectra))
    }
}

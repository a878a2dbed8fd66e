// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The TOML run configuration.
//!
//! Every knob has a named, typed field; a config that parses is then
//! validated once at startup so that a bad value can never surface halfway
//! through a batch.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

use crate::sphere::is_valid_nside;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Couldn't read config file {path}: {io_error}")]
    Io {
        io_error: std::io::Error,
        path: String,
    },

    #[error("Couldn't parse config file {path}: {parse_error}")]
    Parse {
        parse_error: Box<toml::de::Error>,
        path: String,
    },

    #[error("Bad config value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Which file-layout dialect the map reader speaks.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "dialect", rename_all = "lowercase")]
pub enum ReaderConfig {
    /// All products in one directory; filename patterns come from the
    /// `templates` table, keyed by channel-set kind with optional `_survey`
    /// and `_halfring` suffixes, with `{frequency}`, `{channel}`, `{survey}`
    /// and `{halfring}` placeholders.
    Flat {
        root: PathBuf,
        templates: BTreeMap<String, String>,
    },

    /// Categorised subfolders (`Surveys/`, `JackKnife/`, `Couple_horn/`,
    /// `Single_Radiometer/`, `bandpass_correction/`, `MASKs/`) with the
    /// standard archive filename convention.
    Tree { root: PathBuf },
}

impl ReaderConfig {
    pub fn root(&self) -> &Path {
        match self {
            ReaderConfig::Flat { root, .. } => root,
            ReaderConfig::Tree { root } => root,
        }
    }
}

fn default_survey_list() -> Vec<u8> {
    vec![1, 2, 3, 4, 5]
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunConfig {
    pub reader: ReaderConfig,

    /// Analysis resolution maps are harmonised to on read.
    pub nside: usize,

    /// FWHM of the smoothing applied to combined maps, degrees.
    pub smoothing_fwhm_deg: f64,

    /// Resolution of the persisted (smoothed) output maps.
    pub degraded_nside: usize,

    #[serde(default = "default_true")]
    pub compute_spectra: bool,

    pub output_folder: PathBuf,

    pub frequency_list: Vec<u32>,

    #[serde(default = "default_survey_list")]
    pub survey_list: Vec<u8>,

    #[serde(default)]
    pub run_halfrings: bool,

    #[serde(default)]
    pub run_surveydiff: bool,

    #[serde(default)]
    pub run_chdiff: bool,

    #[serde(default)]
    pub compute_union_mask: bool,

    /// Extra mask files ORed into each union-mask product.
    #[serde(default)]
    pub union_extra_masks: Vec<PathBuf>,

    #[serde(default)]
    pub parallel: bool,
}

impl RunConfig {
    pub fn load(path: &Path) -> Result<RunConfig, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|io_error| ConfigError::Io {
            io_error,
            path: path.display().to_string(),
        })?;
        let config: RunConfig = toml::from_str(&text).map_err(|parse_error| ConfigError::Parse {
            parse_error: Box::new(parse_error),
            path: path.display().to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !is_valid_nside(self.nside) {
            return Err(ConfigError::Invalid {
                field: "nside",
                reason: format!("{} is not a power of two", self.nside),
            });
        }
        if !is_valid_nside(self.degraded_nside) {
            return Err(ConfigError::Invalid {
                field: "degraded_nside",
                reason: format!("{} is not a power of two", self.degraded_nside),
            });
        }
        if self.degraded_nside > self.nside {
            return Err(ConfigError::Invalid {
                field: "degraded_nside",
                reason: format!(
                    "output resolution {} exceeds the analysis resolution {}",
                    self.degraded_nside, self.nside
                ),
            });
        }
        if !(self.smoothing_fwhm_deg > 0.0) {
            return Err(ConfigError::Invalid {
                field: "smoothing_fwhm_deg",
                reason: format!("{} is not a positive angle", self.smoothing_fwhm_deg),
            });
        }
        if self.frequency_list.is_empty() {
            return Err(ConfigError::Invalid {
                field: "frequency_list",
                reason: "no frequencies listed".to_string(),
            });
        }
        if (self.run_surveydiff || self.run_chdiff || self.compute_union_mask)
            && self.survey_list.is_empty()
        {
            return Err(ConfigError::Invalid {
                field: "survey_list",
                reason: "survey differences requested with an empty survey list".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;

    use super::*;

    fn parse(text: &str) -> Result<RunConfig, ConfigError> {
        let config: RunConfig = toml::from_str(text).map_err(|parse_error| ConfigError::Parse {
            parse_error: Box::new(parse_error),
            path: "inline".to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    #[test]
    fn test_tree_config_parses() {
        let config = parse(indoc! {r#"
            nside = 1024
            smoothing_fwhm_deg = 2.0
            degraded_nside = 32
            output_folder = "null_tests"
            frequency_list = [30, 44, 70]
            run_halfrings = true
            parallel = true

            [reader]
            dialect = "tree"
            root = "/archive/dx9"
        "#})
        .unwrap();
        assert!(matches!(config.reader, ReaderConfig::Tree { .. }));
        assert!(config.compute_spectra);
        assert_eq!(config.survey_list, vec![1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_flat_config_parses() {
        let config = parse(indoc! {r#"
            nside = 1024
            smoothing_fwhm_deg = 2.0
            degraded_nside = 32
            output_folder = "null_tests"
            frequency_list = [30]

            [reader]
            dialect = "flat"
            root = "/archive/flat"

            [reader.templates]
            map_frequency = "LFI_{frequency}_*_{survey}.fits"
            ps_mask = "mask_ps_{frequency}.fits"
            spectra_mask = "destripingmask_{frequency}.fits"
        "#})
        .unwrap();
        match &config.reader {
            ReaderConfig::Flat { templates, .. } => {
                assert_eq!(templates.len(), 3);
            }
            _ => panic!("expected the flat dialect"),
        }
    }

    #[test]
    fn test_bad_nside_is_rejected() {
        let result = parse(indoc! {r#"
            nside = 1000
            smoothing_fwhm_deg = 2.0
            degraded_nside = 32
            output_folder = "out"
            frequency_list = [30]

            [reader]
            dialect = "tree"
            root = "/archive"
        "#});
        assert!(matches!(
            result,
            Err(ConfigError::Invalid { field: "nside", .. })
        ));
    }

    #[test]
    fn test_unknown_keys_are_rejected() {
        let result = parse(indoc! {r#"
            nside = 1024
            smoothing_fwhm_deg = 2.0
            degraded_nside = 32
            output_folder = "out"
            frequency_list = [30]
            no_such_option = 1

            [reader]
            dialect = "tree"
            root = "/archive"
        "#});
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }
}

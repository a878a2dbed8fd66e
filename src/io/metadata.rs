// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! The metadata sidecar written next to each map or spectrum product.
//!
//! The record is accumulated builder-style: every pipeline stage takes the
//! record by value and returns an extended copy, so no two stages ever race
//! on a shared reference and field-overwrite ordering cannot matter.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("{path}: {io_error}")]
    Io {
        io_error: std::io::Error,
        path: String,
    },

    #[error("{path}: {serde_error}")]
    Serde {
        serde_error: serde_json::Error,
        path: String,
    },
}

#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub survey: String,
    #[serde(default)]
    pub base_file_name: String,
    #[serde(default)]
    pub file_type: String,

    /// Numeric diagnostics keyed by name (chi-squares, removed monopole,
    /// white-noise levels, per-component statistics).
    #[serde(flatten)]
    pub values: BTreeMap<String, serde_json::Value>,
}

impl Metadata {
    pub fn with_title(mut self, title: impl Into<String>) -> Metadata {
        self.title = title.into();
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Metadata {
        self.channel = channel.into();
        self
    }

    pub fn with_survey(mut self, survey: impl Into<String>) -> Metadata {
        self.survey = survey.into();
        self
    }

    pub fn with_base_file_name(mut self, base: impl Into<String>) -> Metadata {
        self.base_file_name = base.into();
        self
    }

    pub fn with_file_type(mut self, file_type: impl Into<String>) -> Metadata {
        self.file_type = file_type.into();
        self
    }

    pub fn with_value(mut self, key: impl Into<String>, value: f64) -> Metadata {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn with_vector(mut self, key: impl Into<String>, value: &[f64]) -> Metadata {
        self.values.insert(key.into(), value.to_vec().into());
        self
    }

    /// A numeric diagnostic, if present.
    pub fn value(&self, key: &str) -> Option<f64> {
        self.values.get(key).and_then(|v| v.as_f64())
    }

    pub fn write(&self, path: &Path) -> Result<(), MetadataError> {
        let json = serde_json::to_string_pretty(self).map_err(|serde_error| {
            MetadataError::Serde {
                serde_error,
                path: path.display().to_string(),
            }
        })?;
        std::fs::write(path, json).map_err(|io_error| MetadataError::Io {
            io_error,
            path: path.display().to_string(),
        })
    }

    pub fn read(path: &Path) -> Result<Metadata, MetadataError> {
        let json = std::fs::read_to_string(path).map_err(|io_error| MetadataError::Io {
            io_error,
            path: path.display().to_string(),
        })?;
        serde_json::from_str(&json).map_err(|serde_error| MetadataError::Serde {
            serde_error,
            path: path.display().to_string(),
        })
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Error type for all skynull-related errors.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SkynullError {
    #[error("{0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("{0}")]
    Reader(#[from] crate::reader::ReaderError),

    #[error("{0}")]
    Combine(#[from] crate::combine::CombineError),

    #[error("{0}")]
    Driver(#[from] crate::driver::DriverError),

    #[error("{0}")]
    Fits(#[from] crate::io::fits::FitsError),

    #[error("{0}")]
    Component(#[from] crate::map::UnknownComponent),
}

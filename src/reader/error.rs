// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use thiserror::Error;

use super::ChannelSetKind;
use crate::io::fits::FitsError;
use crate::io::GlobError;
use crate::map::Stokes;
use crate::mask::MaskError;
use crate::sphere::SphereError;

#[derive(Error, Debug)]
pub enum ReaderError {
    #[error("No file matched the pattern {pattern}")]
    NotFound { pattern: String },

    #[error("Conflicting matches for the pattern {pattern}; refusing to guess")]
    Ambiguous { pattern: String },

    #[error("Component {component} is not carried by {kind} maps")]
    UnsupportedComponent {
        component: Stokes,
        kind: ChannelSetKind,
    },

    #[error("The reader configuration has no template named {key}")]
    MissingTemplate { key: String },

    #[error("Bad map selector: {reason}")]
    InvalidSelector { reason: String },

    #[error(transparent)]
    Fits(#[from] FitsError),

    #[error(transparent)]
    Glob(#[from] GlobError),

    #[error(transparent)]
    Mask(#[from] MaskError),

    #[error(transparent)]
    Sphere(#[from] SphereError),
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

use std::process::ExitCode;

use clap::Parser;
use log::error;

use skynull::cli::Skynull;

fn main() -> ExitCode {
    match Skynull::parse().run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            // The logger may not be initialised if the error came out of
            // argument handling; make sure the user sees something.
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

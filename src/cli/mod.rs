// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Command-line interface code.
//!
//! Only 2 things should be public in this module: `Skynull` and
//! `Skynull::run`.

use std::path::PathBuf;

use clap::{AppSettings, Args, Parser, Subcommand};
use log::info;
use vec1::Vec1;

use crate::combine::smooth_and_save;
use crate::config::{ConfigError, RunConfig};
use crate::error::SkynullError;
use crate::io::fits::read_map_columns;
use crate::map::{parse_components, MapSet, MaskedMap};

#[derive(Debug, Parser)]
#[clap(
    version,
    about = "Null-test analysis for CMB survey sky maps: weighted map \
             differences, chi-square diagnostics and angular power spectra."
)]
#[clap(global_setting(AppSettings::DeriveDisplayOrder))]
#[clap(disable_help_subcommand = true)]
#[clap(infer_subcommands = true)]
#[clap(propagate_version = true)]
#[clap(infer_long_args = true)]
pub struct Skynull {
    #[clap(flatten)]
    global_opts: GlobalArgs,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Args)]
struct GlobalArgs {
    /// The verbosity of the program. Increase by specifying multiple times
    /// (e.g. -vv). The default is to print only high-level information.
    #[clap(short, long, parse(from_occurrences))]
    #[clap(global = true)]
    verbosity: u8,

    /// Only resolve and print the files each comparison would read.
    #[clap(long)]
    #[clap(global = true)]
    dry_run: bool,
}

#[derive(Debug, Subcommand)]
#[clap(arg_required_else_help = true)]
enum Command {
    #[clap(about = "Run the configured null-test batch.")]
    Run(RunArgs),

    #[clap(about = "Build the per-frequency union masks only.")]
    UnionMask(RunArgs),

    #[clap(
        about = "Combine MAP/WEIGHT pairs ad hoc: weighted sum, smooth, \
                 degrade, save."
    )]
    Combine(CombineArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Path to the TOML run configuration.
    #[clap(name = "CONFIG")]
    config: PathBuf,
}

#[derive(Debug, Args)]
struct CombineArgs {
    /// Alternating map paths and weights: MAP1 W1 [MAP2 W2] ...
    #[clap(name = "MAP_AND_WEIGHT", required = true)]
    maps_and_weights: Vec<String>,

    /// Name of the output map file.
    #[clap(short, long, default_value = "output.fits")]
    output: PathBuf,

    /// FWHM in degrees of the smoothing filter; 0 skips smoothing.
    #[clap(long, default_value_t = 2.0)]
    smoothing_angle: f64,

    /// NSIDE of the output map.
    #[clap(long, default_value_t = 32)]
    degraded_nside: usize,

    /// Comma-separated components to combine, e.g. "I,Q,U".
    #[clap(short, long, default_value = "I,Q,U")]
    components: String,
}

impl Skynull {
    pub fn run(self) -> Result<(), SkynullError> {
        setup_logging(self.global_opts.verbosity).expect("Failed to initialise logging.");
        info!("skynull {}", env!("CARGO_PKG_VERSION"));

        match self.command {
            Command::Run(args) => {
                let config = RunConfig::load(&args.config)?;
                crate::driver::run(&config, self.global_opts.dry_run)?;
            }

            Command::UnionMask(args) => {
                let mut config = RunConfig::load(&args.config)?;
                config.run_halfrings = false;
                config.run_surveydiff = false;
                config.run_chdiff = false;
                config.compute_union_mask = true;
                crate::driver::run(&config, self.global_opts.dry_run)?;
            }

            Command::Combine(args) => {
                let components = parse_components(&args.components)?;
                if components.is_empty() {
                    return Err(ConfigError::Invalid {
                        field: "components",
                        reason: "no components requested".to_string(),
                    }
                    .into());
                }
                let columns: Vec<usize> = components.iter().map(|c| c.full_index()).collect();

                if args.maps_and_weights.len() % 2 != 0 {
                    return Err(ConfigError::Invalid {
                        field: "MAP_AND_WEIGHT",
                        reason: "every map must be followed by its weight".to_string(),
                    }
                    .into());
                }
                let mut inputs = vec![];
                for chunk in args.maps_and_weights.chunks(2) {
                    let (path, weight) = (&chunk[0], &chunk[1]);
                    let weight: f64 = weight.parse().map_err(|_| ConfigError::Invalid {
                        field: "MAP_AND_WEIGHT",
                        reason: format!("'{weight}' is not a number"),
                    })?;
                    let pixels = read_map_columns(std::path::Path::new(path), &columns)?;
                    let maps = pixels.into_iter().map(MaskedMap::from_raw).collect();
                    inputs.push((MapSet::new(components.clone(), maps), weight));
                }
                let inputs = Vec1::try_from_vec(inputs).map_err(|_| ConfigError::Invalid {
                    field: "MAP_AND_WEIGHT",
                    reason: "at least one map and weight are required".to_string(),
                })?;

                smooth_and_save(
                    &inputs,
                    args.smoothing_angle.to_radians(),
                    args.degraded_nside,
                    &args.output,
                )?;
            }
        }

        Ok(())
    }
}

fn setup_logging(verbosity: u8) -> Result<(), log::SetLoggerError> {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .try_init()
}

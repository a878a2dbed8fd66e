// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! Helper functions for reading and writing FITS files.
//!
//! Sky maps are binary-table HDUs carrying one column per component with
//! `NSIDE` and `ORDERING` keys; NESTED inputs are reordered to RING on read
//! and bad-pixel sentinels become masked pixels downstream. Power spectra are
//! image HDUs.

use std::path::Path;

use fitsio::{
    hdu::{FitsHdu, HduInfo},
    images::{ImageDescription, ImageType},
    tables::{ColumnDataType, ColumnDescription},
    FitsFile,
};
use thiserror::Error;

use crate::sphere::{is_valid_nside, nest2ring, nside2npix};

#[derive(Error, Debug)]
pub enum FitsError {
    /// An error when opening or creating a fits file.
    #[error("{fits_filename}: {fits_error}\n(code at {source_file}:{source_line})")]
    Open {
        fits_error: Box<fitsio::errors::Error>,
        fits_filename: Box<Path>,
        source_file: &'static str,
        source_line: u32,
    },

    /// A generic cfitsio error with HDU context.
    #[error("{fits_filename} HDU {hdu_description}: {fits_error}\n(code at {source_file}:{source_line})")]
    Fitsio {
        fits_error: Box<fitsio::errors::Error>,
        fits_filename: Box<Path>,
        hdu_description: Box<str>,
        source_file: &'static str,
        source_line: u32,
    },

    #[error("{fits_filename}: couldn't parse key {key}")]
    Parse {
        key: Box<str>,
        fits_filename: Box<Path>,
    },

    #[error("{fits_filename}: the key {key} is missing")]
    MissingKey {
        key: Box<str>,
        fits_filename: Box<Path>,
    },

    #[error("{fits_filename} HDU {hdu_num} is not a binary table")]
    NotTable {
        fits_filename: Box<Path>,
        hdu_num: usize,
    },

    #[error("{fits_filename} has no column with index {index}")]
    NoSuchColumn {
        fits_filename: Box<Path>,
        index: usize,
    },

    #[error("{fits_filename}: NSIDE {nside} is not a power of two")]
    BadNside {
        fits_filename: Box<Path>,
        nside: usize,
    },

    #[error("{fits_filename}: column {column} has {actual} values; expected {expected}")]
    BadShape {
        fits_filename: Box<Path>,
        column: String,
        expected: usize,
        actual: usize,
    },

    #[error("IO error when overwriting {fits_filename}: {io_error}")]
    Io {
        io_error: std::io::Error,
        fits_filename: Box<Path>,
    },
}

/// Open a fits file.
#[track_caller]
pub fn fits_open<P: AsRef<Path>>(file: P) -> Result<FitsFile, FitsError> {
    FitsFile::open(file.as_ref()).map_err(|e| {
        let caller = std::panic::Location::caller();
        FitsError::Open {
            fits_error: Box::new(e),
            fits_filename: file.as_ref().to_path_buf().into_boxed_path(),
            source_file: caller.file(),
            source_line: caller.line(),
        }
    })
}

/// Create a fits file, replacing any existing file at the same path.
#[track_caller]
pub fn fits_create<P: AsRef<Path>>(file: P) -> Result<FitsFile, FitsError> {
    if file.as_ref().exists() {
        std::fs::remove_file(file.as_ref()).map_err(|io_error| FitsError::Io {
            io_error,
            fits_filename: file.as_ref().to_path_buf().into_boxed_path(),
        })?;
    }
    FitsFile::create(file.as_ref()).open().map_err(|e| {
        let caller = std::panic::Location::caller();
        FitsError::Open {
            fits_error: Box::new(e),
            fits_filename: file.as_ref().to_path_buf().into_boxed_path(),
            source_file: caller.file(),
            source_line: caller.line(),
        }
    })
}

/// Open a fits file's HDU.
#[track_caller]
pub fn fits_open_hdu(fits_fptr: &mut FitsFile, hdu_num: usize) -> Result<FitsHdu, FitsError> {
    fits_fptr.hdu(hdu_num).map_err(|e| {
        let caller = std::panic::Location::caller();
        FitsError::Fitsio {
            fits_error: Box::new(e),
            fits_filename: fits_fptr.filename.clone().into_boxed_path(),
            hdu_description: format!("{hdu_num}").into_boxed_str(),
            source_file: caller.file(),
            source_line: caller.line(),
        }
    })
}

/// Given a FITS file pointer, a HDU that belongs to it, and a keyword that may
/// or may not exist, pull out the value of the keyword, parsing it into the
/// desired type.
#[track_caller]
pub fn fits_get_optional_key<T: std::str::FromStr>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    keyword: &str,
) -> Result<Option<T>, FitsError> {
    let unparsed_value: String = match hdu.read_key(fits_fptr, keyword) {
        Ok(key_value) => key_value,
        Err(e) => match &e {
            fitsio::errors::Error::Fits(fe) => match fe.status {
                202 | 204 => return Ok(None),
                _ => {
                    let caller = std::panic::Location::caller();
                    return Err(FitsError::Fitsio {
                        fits_error: Box::new(e),
                        fits_filename: fits_fptr.filename.clone().into_boxed_path(),
                        hdu_description: format!("{}", hdu.number + 1).into_boxed_str(),
                        source_file: caller.file(),
                        source_line: caller.line(),
                    });
                }
            },
            _ => {
                let caller = std::panic::Location::caller();
                return Err(FitsError::Fitsio {
                    fits_error: Box::new(e),
                    fits_filename: fits_fptr.filename.clone().into_boxed_path(),
                    hdu_description: format!("{}", hdu.number + 1).into_boxed_str(),
                    source_file: caller.file(),
                    source_line: caller.line(),
                });
            }
        },
    };

    match unparsed_value.trim().trim_matches('\'').trim().parse() {
        Ok(parsed_value) => Ok(Some(parsed_value)),
        Err(_) => Err(FitsError::Parse {
            key: keyword.to_string().into_boxed_str(),
            fits_filename: fits_fptr.filename.clone().into_boxed_path(),
        }),
    }
}

/// Given a FITS file pointer, a HDU that belongs to it, and a keyword, pull out
/// the value of the keyword, parsing it into the desired type.
#[track_caller]
pub fn fits_get_required_key<T: std::str::FromStr>(
    fits_fptr: &mut FitsFile,
    hdu: &FitsHdu,
    keyword: &str,
) -> Result<T, FitsError> {
    match fits_get_optional_key(fits_fptr, hdu, keyword) {
        Ok(Some(value)) => Ok(value),
        Ok(None) => Err(FitsError::MissingKey {
            key: keyword.to_string().into_boxed_str(),
            fits_filename: fits_fptr.filename.clone().into_boxed_path(),
        }),
        Err(error) => Err(error),
    }
}

/// The column names of a binary-table HDU, in table order.
fn table_column_names(fits_fptr: &FitsFile, hdu: &FitsHdu) -> Result<Vec<String>, FitsError> {
    match &hdu.info {
        HduInfo::TableInfo {
            column_descriptions,
            ..
        } => Ok(column_descriptions.iter().map(|c| c.name.clone()).collect()),
        _ => Err(FitsError::NotTable {
            fits_filename: fits_fptr.filename.clone().into_boxed_path(),
            hdu_num: hdu.number + 1,
        }),
    }
}

/// Read the requested columns (by position) of a sky-map file, reordering
/// NESTED maps to RING. Returns one pixel array per requested column.
pub fn read_map_columns(path: &Path, columns: &[usize]) -> Result<Vec<Vec<f64>>, FitsError> {
    let mut fptr = fits_open(path)?;
    let hdu = fits_open_hdu(&mut fptr, 1)?;
    let nside: usize = fits_get_required_key(&mut fptr, &hdu, "NSIDE")?;
    if !is_valid_nside(nside) {
        return Err(FitsError::BadNside {
            fits_filename: path.to_path_buf().into_boxed_path(),
            nside,
        });
    }
    let ordering: String = fits_get_required_key(&mut fptr, &hdu, "ORDERING")?;
    let nested = ordering.eq_ignore_ascii_case("NESTED");
    let names = table_column_names(&fptr, &hdu)?;
    let npix = nside2npix(nside);

    let mut out = Vec::with_capacity(columns.len());
    for &index in columns {
        let name = names.get(index).ok_or_else(|| FitsError::NoSuchColumn {
            fits_filename: path.to_path_buf().into_boxed_path(),
            index,
        })?;
        let data: Vec<f64> = hdu.read_col(&mut fptr, name).map_err(|e| {
            let caller = std::panic::Location::caller();
            FitsError::Fitsio {
                fits_error: Box::new(e),
                fits_filename: path.to_path_buf().into_boxed_path(),
                hdu_description: format!("{}", hdu.number + 1).into_boxed_str(),
                source_file: caller.file(),
                source_line: caller.line(),
            }
        })?;
        if data.len() != npix {
            return Err(FitsError::BadShape {
                fits_filename: path.to_path_buf().into_boxed_path(),
                column: name.clone(),
                expected: npix,
                actual: data.len(),
            });
        }
        if nested {
            let mut ring = vec![0.0; npix];
            for (i, v) in data.into_iter().enumerate() {
                ring[nest2ring(nside, i)] = v;
            }
            out.push(ring);
        } else {
            out.push(data);
        }
    }
    Ok(out)
}

/// Write a RING-ordered sky map as a binary-table HDU, one column per
/// component. Masked pixels must already carry the bad-pixel sentinel.
pub fn write_map_columns(
    path: &Path,
    names: &[&str],
    columns: &[Vec<f64>],
    nside: usize,
) -> Result<(), FitsError> {
    let mut fptr = fits_create(path)?;
    let wrap = |e: fitsio::errors::Error| {
        let caller = std::panic::Location::caller();
        FitsError::Fitsio {
            fits_error: Box::new(e),
            fits_filename: path.to_path_buf().into_boxed_path(),
            hdu_description: "MAP".into(),
            source_file: caller.file(),
            source_line: caller.line(),
        }
    };

    let descriptions = names
        .iter()
        .map(|name| {
            ColumnDescription::new(*name)
                .with_type(ColumnDataType::Double)
                .create()
        })
        .collect::<Result<Vec<_>, _>>()
        .map_err(wrap)?;
    let hdu = fptr.create_table("MAP", &descriptions).map_err(wrap)?;

    hdu.write_key(&mut fptr, "PIXTYPE", "HEALPIX").map_err(wrap)?;
    hdu.write_key(&mut fptr, "ORDERING", "RING").map_err(wrap)?;
    hdu.write_key(&mut fptr, "NSIDE", nside as i64).map_err(wrap)?;
    hdu.write_key(&mut fptr, "COORDSYS", "G").map_err(wrap)?;
    for (name, column) in names.iter().zip(columns.iter()) {
        hdu.write_col(&mut fptr, name, column).map_err(wrap)?;
    }
    Ok(())
}

/// Write an angular power spectrum as the primary image HDU.
pub fn write_cl(path: &Path, cl: &[f64]) -> Result<(), FitsError> {
    if path.exists() {
        std::fs::remove_file(path).map_err(|io_error| FitsError::Io {
            io_error,
            fits_filename: path.to_path_buf().into_boxed_path(),
        })?;
    }
    let description = ImageDescription {
        data_type: ImageType::Double,
        dimensions: &[cl.len()],
    };
    let mut fptr = FitsFile::create(path)
        .with_custom_primary(&description)
        .open()
        .map_err(|e| {
            let caller = std::panic::Location::caller();
            FitsError::Open {
                fits_error: Box::new(e),
                fits_filename: path.to_path_buf().into_boxed_path(),
                source_file: caller.file(),
                source_line: caller.line(),
            }
        })?;
    let hdu = fits_open_hdu(&mut fptr, 0)?;
    hdu.write_image(&mut fptr, cl).map_err(|e| {
        let caller = std::panic::Location::caller();
        FitsError::Fitsio {
            fits_error: Box::new(e),
            fits_filename: path.to_path_buf().into_boxed_path(),
            hdu_description: "0".into(),
            source_file: caller.file(),
            source_line: caller.line(),
        }
    })
}

/// Read an angular power spectrum written by [write_cl].
pub fn read_cl(path: &Path) -> Result<Vec<f64>, FitsError> {
    let mut fptr = fits_open(path)?;
    let hdu = fits_open_hdu(&mut fptr, 0)?;
    hdu.read_image(&mut fptr).map_err(|e| {
        let caller = std::panic::Location::caller();
        FitsError::Fitsio {
            fits_error: Box::new(e),
            fits_filename: path.to_path_buf().into_boxed_path(),
            hdu_description: "0".into(),
            source_file: caller.file(),
            source_line: caller.line(),
        }
    })
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;

    use super::*;
    use crate::constants::UNSEEN;

    #[test]
    fn test_map_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.fits");
        let nside = 4;
        let npix = nside2npix(nside);
        let i: Vec<f64> = (0..npix).map(|p| p as f64).collect();
        let mut q = vec![1.0; npix];
        q[7] = UNSEEN;
        write_map_columns(&path, &["TEMPERATURE", "Q_POLARISATION"], &[i.clone(), q.clone()], nside)
            .unwrap();

        let cols = read_map_columns(&path, &[0, 1]).unwrap();
        for (a, b) in cols[0].iter().zip(i.iter()) {
            assert_abs_diff_eq!(a, b);
        }
        for (a, b) in cols[1].iter().zip(q.iter()) {
            assert_abs_diff_eq!(a, b);
        }

        // Out-of-range column positions are an error, not a panic.
        assert!(read_map_columns(&path, &[2]).is_err());
    }

    #[test]
    fn test_cl_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cl.fits");
        let cl: Vec<f64> = (0..48).map(|l| 1.0 / (l + 1) as f64).collect();
        write_cl(&path, &cl).unwrap();
        let back = read_cl(&path).unwrap();
        assert_eq!(back.len(), cl.len());
        for (a, b) in back.iter().zip(cl.iter()) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_missing_file_is_an_open_error() {
        let result = fits_open("definitely/not/here.fits");
        assert!(matches!(result, Err(FitsError::Open { .. })));
    }
}

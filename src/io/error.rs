//! Errors that can occur in the io module

use thiserror::Error;

#[derive(Error, Debug)]
#[allow(clippy::upper_case_acronyms)]
/// All the errors that can occur in file io operations
pub enum IOError {
    /// Error when opening or creating a fits file.
    #[error("{source_file}:{source_line}\nCouldn't open {fits_filename}: {fits_error}")]
    FitsOpen {
        /// The [`fitsio::errors::Error`]
        fits_error: fitsio::errors::Error,
        /// The filename of the fits file
        fits_filename: String,
        /// The file where the error originated (usually `file!()`)
        source_file: &'static str,
        /// The line number where the error originated (usually `line!()`)
        source_line: u32,
    },

    /// A generic error associated with the fitsio crate.
    #[error("{source_file}:{source_line}\n{fits_filename} HDU {hdu_name}: {fits_error}")]
    FitsIO {
        /// The [`fitsio::errors::Error`]
        fits_error: fitsio::errors::Error,
        /// The filename of the fits file where the error occurred
        fits_filename: String,
        /// The name of the HDU where the error occurred
        hdu_name: String,
        /// The file where the error originated (usually `file!()`)
        source_file: &'static str,
        /// The line number where the error originated (usually `line!()`)
        source_line: u32,
    },

    #[error("{0}")]
    /// Error derived from [`fitsio::errors::Error`]
    FitsioError(#[from] fitsio::errors::Error),

    #[error("{0}")]
    /// Error derived from [`std::io::Error`]
    StdIo(#[from] std::io::Error),

    /// The manifest of a file couldn't be parsed.
    #[error("bad manifest in {fits_filename}: {source}")]
    Manifest {
        /// The filename of the fits file
        fits_filename: String,
        /// The [`serde_json::Error`]
        source: serde_json::Error,
    },

    /// A dataset listed in the manifest has no HDU, or the manifest itself is missing.
    #[error("{fits_filename} has no HDU named {hdu_name}")]
    MissingHdu {
        /// The filename of the fits file
        fits_filename: String,
        /// The HDU that was expected
        hdu_name: String,
    },

    /// Files that are meant to be time segments of one dataset disagree.
    #[error("inconsistent input file {fits_filename}: expected {expected}, found {found}")]
    InconsistentFiles {
        /// The file that disagrees with the first
        fits_filename: String,
        /// What the first file has
        expected: String,
        /// What this file has
        found: String,
    },

    /// Error when a path template has more than one run of `%`.
    #[error("{source_file}:{source_line}\nInvalid iteration template {template}. Must contain at most one run of \"%\"")]
    InvalidIterationTemplate {
        /// The file where the error originated (usually `file!()`)
        source_file: &'static str,
        /// The line number where the error originated (usually `line!()`)
        source_line: u32,
        /// The path template
        template: String,
    },

    /// Reading needs at least one input file.
    #[error("no input files were given")]
    NoInputFiles,

    /// Writing needs at least one output file.
    #[error("no output files were given")]
    NoOutputFiles,

    /// Writing was done on worker 0, which failed.
    #[error("worker 0 failed to write {path}")]
    RemoteWriteFailed {
        /// The path being written
        path: String,
    },
}

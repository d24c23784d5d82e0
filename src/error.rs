//! Errors that can occur in todpipe

use thiserror::Error;

use crate::{comm::CommError, io::error::IOError};

#[derive(Error, Debug)]
/// Errors relating to CLI invocation
pub enum CLIError {
    /// When a bad CLI argument is provided
    #[error("Invalid Command Line Argument {option}\nexpected {expected}, received {received}")]
    InvalidCommandLineArgument {
        /// The argument name within the clap app
        option: String,
        /// Description of what would have been a valid value
        expected: String,
        /// The value that was received instead
        received: String,
    },
}

/// An enum of all the errors possible in todpipe
#[derive(Error, Debug)]
pub enum TodError {
    /// Redistribution or selection was requested along an axis the main data doesn't have.
    #[error("invalid axis {axis} for {function}, the main data has axes {available}")]
    InvalidAxis {
        /// The axis that was requested
        axis: String,
        /// The function that was called
        function: String,
        /// The logical axes of the main data
        available: String,
    },

    /// A dataset's length along an aligned axis disagrees with the main data.
    #[error("shape mismatch for dataset {name} along the {axis} axis: expected {expected}, received {received}")]
    ShapeMismatch {
        /// The dataset being registered
        name: String,
        /// The logical axis that disagrees
        axis: String,
        /// The global extent of the main data along that axis
        expected: usize,
        /// The global extent of the new dataset along that axis
        received: usize,
    },

    /// Neither orientation of a correlator channel pair exists in the baseline order.
    #[error("channel pair ({}, {}) was not found in the baseline order in either orientation", pair.0, pair.1)]
    PairNotFound {
        /// The pair that was looked up
        pair: (i64, i64),
    },

    /// Separation found baseline-aligned metadata it can't remap.
    #[error("can't separate polarizations, found unexpected baseline-ordered datasets: {names:?}")]
    UnexpectedAuxiliaryDataset {
        /// The offending dataset names
        names: Vec<String>,
    },

    /// Map-making was given a telescope type without a geometry model.
    #[error("unknown array geometry for telescope {telescope:?}")]
    UnknownArrayGeometry {
        /// The value of the `telescope` attribute
        telescope: String,
    },

    /// Too few frequency points to flag. This is surfaced as a warning, never returned as `Err`.
    #[error("Not enough frequency points to do the flagging: {nfreq} < {freq_points}")]
    InsufficientData {
        /// The global length of the frequency axis
        nfreq: usize,
        /// The configured minimum number of frequency points
        freq_points: usize,
    },

    /// A dataset that doesn't exist in the container was requested.
    #[error("no dataset named {name} in the container")]
    UnknownDataset {
        /// The name that was requested
        name: String,
    },

    /// A dataset with this name already exists in the container.
    #[error("a dataset named {name} already exists in the container")]
    DuplicateDataset {
        /// The name that was registered twice
        name: String,
    },

    /// A selection could not be applied.
    #[error("bad {option} selection: {reason}")]
    BadSelection {
        /// The selection option
        option: String,
        /// Why it was rejected
        reason: String,
    },

    /// An operation that only makes sense on one container kind.
    #[error("{function} requires a {expected} container, found {found}")]
    WrongContainerKind {
        /// The operation that was attempted
        function: String,
        /// The container kind it requires
        expected: String,
        /// The container kind it was given
        found: String,
    },

    /// The on-disk main data has a rank that matches no container kind.
    #[error("main data with {ndim} dimensions is neither a raw nor a separated timestream")]
    UnrecognisedContainerShape {
        /// The rank of the main data
        ndim: usize,
    },

    /// A required container attribute is missing or has the wrong type.
    #[error("missing or malformed attribute {name}, expected {expected}")]
    MissingAttribute {
        /// The attribute name
        name: String,
        /// Description of the expected value
        expected: String,
    },

    /// A dataset holds a different element type than the operation needs.
    #[error("dataset {name} holds {found} values, expected {expected}")]
    DataTypeMismatch {
        /// The dataset name
        name: String,
        /// The element type that was expected
        expected: String,
        /// The element type that was found
        found: String,
    },

    /// Error when an array doesn't have the shape an operation expects.
    #[error("bad array shape supplied to argument {argument} of function {function}. expected {expected}, received {received}")]
    BadArrayShape {
        /// The argument name within the funciton
        argument: String,
        /// The function name
        function: String,
        /// The expected shape
        expected: String,
        /// The shape that was received instead
        received: String,
    },

    /// Error when not enough memory is available for an allocation.
    #[error("Insufficient memory available; need {need_gib} GiB of memory.\nPlease select a smaller subset of the data.")]
    InsufficientMemory {
        /// The amount of memory we think we need
        need_gib: usize,
    },

    /// Error derived from [`ndarray::ShapeError`]
    #[error(transparent)]
    ShapeError(#[from] ndarray::ShapeError),

    /// Error derived from [`CommError`]
    #[error(transparent)]
    Comm(#[from] CommError),

    /// Error derived from [`crate::io::error::IOError`]
    #[error(transparent)]
    IOError(#[from] IOError),

    /// Error derived from [`CLIError`]
    #[error(transparent)]
    CLIError(#[from] CLIError),

    #[cfg(feature = "cli")]
    /// Error derived from [`clap::Error`]
    #[error(transparent)]
    ClapError(#[from] clap::Error),

    /// Dry run: the summary was printed and nothing will be processed.
    #[error("Dry run")]
    DryRun {},
}

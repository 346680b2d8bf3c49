//! Definition of errors.

use std::error::Error;
use std::fmt;
use std::io;

/// A specialized Result type for this crate.
pub type Result<T, E = TricrfError> = std::result::Result<T, E>;

/// The error type for training and inference.
#[derive(Debug)]
pub enum TricrfError {
    /// An unparseable line in a data or configuration file.
    Format(FormatError),

    /// An invalid argument passed to a public operation.
    InvalidArgument(InvalidArgumentError),

    /// A model file that cannot be used with the requested model.
    InvalidModel(InvalidModelError),

    /// The optimizer failed to make progress.
    Optimizer(OptimizerError),

    /// An underlying I/O failure.
    Io(io::Error),
}

impl TricrfError {
    pub fn format<S: Into<String>>(file: S, line: usize, msg: S) -> Self {
        Self::Format(FormatError {
            file: file.into(),
            line,
            msg: msg.into(),
        })
    }

    pub const fn invalid_argument(msg: &'static str) -> Self {
        Self::InvalidArgument(InvalidArgumentError { msg })
    }

    pub fn invalid_model<S: Into<String>>(msg: S) -> Self {
        Self::InvalidModel(InvalidModelError { msg: msg.into() })
    }

    pub fn optimizer<S: Into<String>>(msg: S) -> Self {
        Self::Optimizer(OptimizerError { msg: msg.into() })
    }
}

impl fmt::Display for TricrfError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Format(e) => e.fmt(f),
            Self::InvalidArgument(e) => e.fmt(f),
            Self::InvalidModel(e) => e.fmt(f),
            Self::Optimizer(e) => e.fmt(f),
            Self::Io(e) => e.fmt(f),
        }
    }
}

impl Error for TricrfError {}

impl From<io::Error> for TricrfError {
    fn from(error: io::Error) -> Self {
        Self::Io(error)
    }
}

/// Error used when a data or configuration line cannot be parsed.
#[derive(Debug)]
pub struct FormatError {
    /// File the line came from.
    pub file: String,

    /// 1-based line number.
    pub line: usize,

    /// Error message.
    pub msg: String,
}

impl fmt::Display for FormatError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "FormatError: {}:{}: {}", self.file, self.line, self.msg)
    }
}

impl Error for FormatError {}

/// Error used when an argument is invalid.
#[derive(Debug)]
pub struct InvalidArgumentError {
    msg: &'static str,
}

impl fmt::Display for InvalidArgumentError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidArgumentError: {}", self.msg)
    }
}

impl Error for InvalidArgumentError {}

/// Error used when a model file is rejected.
#[derive(Debug)]
pub struct InvalidModelError {
    msg: String,
}

impl fmt::Display for InvalidModelError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "InvalidModelError: {}", self.msg)
    }
}

impl Error for InvalidModelError {}

/// Error used when parameter estimation fails.
#[derive(Debug)]
pub struct OptimizerError {
    msg: String,
}

impl fmt::Display for OptimizerError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "OptimizerError: {}", self.msg)
    }
}

impl Error for OptimizerError {}

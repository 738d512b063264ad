use std::fmt;
use std::io;
use std::result;

/// Everything that can go wrong between reading a product configuration and
/// renaming the finished aggregation into place.
///
/// Planning errors are always fatal. During evaluation, failures writing an
/// unlimited-backed variable are fatal too; only one-shot variable copies are
/// recovered locally (logged and skipped) by the evaluator.
///
#[derive(Debug)]
pub enum Error {
    /// The product configuration failed validation before any I/O happened.
    ConfigInvalid(String),

    /// A granule's fixed dimension size or variable datatype contradicts the
    /// configuration.
    SchemaMismatch(String),

    /// The `index_by` variable of an unlimited dimension cannot be projected
    /// to a sortable numeric sequence.
    IndexVarNonNumeric(String),

    /// The input list was empty.
    NoInputs,

    /// An attribute with the `constant` strategy observed a changed value.
    AttrNotConstant(String),

    /// Underlying reader or writer failure.
    Io(io::Error),

    /// Failure reported by a granule store or output sink adapter.
    Store(String),

    /// Cooperative cancellation was requested; the partial output has been
    /// discarded.
    Cancelled,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ConfigInvalid(msg) => write!(f, "invalid configuration: {msg}"),
            Error::SchemaMismatch(msg) => write!(f, "schema mismatch: {msg}"),
            Error::IndexVarNonNumeric(var) => {
                write!(f, "index variable is not numeric: {var}")
            }
            Error::NoInputs => write!(f, "no input granules given"),
            Error::AttrNotConstant(msg) => write!(f, "non constant attribute: {msg}"),
            Error::Io(err) => write!(f, "I/O error: {err}"),
            Error::Store(msg) => write!(f, "store error: {msg}"),
            Error::Cancelled => write!(f, "aggregation cancelled"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

pub type Result<T> = result::Result<T, Error>;

use std::fmt;

use uuid::Uuid;

use crate::store::StoreError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// The store refused or failed the request; shown to the user, not retried.
    StoreUnavailable(StoreError),

    /// The unordered fallback query failed after the store reported a missing index.
    FallbackExhausted(StoreError),

    /// Nothing to report on, e.g. a grade without students.
    NoData(String),

    StudentNotFound(Uuid),

    /// A height, weight or log amount that is not a positive number.
    InvalidMeasurement(String),

    Config(String),

    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::StoreUnavailable(err) => write!(f, "Store unavailable: {}", err),
            Error::FallbackExhausted(err) => {
                write!(f, "Fallback query failed after missing index: {}", err)
            }
            Error::NoData(msg) => write!(f, "No data: {}", msg),
            Error::StudentNotFound(id) => write!(f, "No student found with id {}", id),
            Error::InvalidMeasurement(msg) => write!(f, "Invalid measurement: {}", msg),
            Error::Config(msg) => write!(f, "Configuration error: {}", msg),
            Error::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::StoreUnavailable(err) | Error::FallbackExhausted(err) => Some(err),
            Error::Io(err) => Some(err),
            Error::NoData(_)
            | Error::StudentNotFound(_)
            | Error::InvalidMeasurement(_)
            | Error::Config(_) => None,
        }
    }
}

impl From<StoreError> for Error {
    fn from(err: StoreError) -> Self {
        Error::StoreUnavailable(err)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Config(err.to_string())
    }
}

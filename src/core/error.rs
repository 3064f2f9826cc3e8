use std::fmt;
use serde::{Deserialize, Serialize};

/// Logical failure kinds surfaced to callers of the core
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    BadInput,
    NotFound,
    Forbidden,
    ConcCalculationFailed,
    AlignedCorpusUnavailable,
    Cancelled,
    Timeout,
    StorageUnavailable,
    Internal,
}

impl ErrorKind {
    /// HTTP status class the web layer should answer with
    pub fn status_code(&self) -> u16 {
        match self {
            ErrorKind::BadInput => 400,
            ErrorKind::AlignedCorpusUnavailable => 400,
            ErrorKind::Forbidden => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::Cancelled => 409,
            ErrorKind::ConcCalculationFailed => 500,
            ErrorKind::Internal => 500,
            ErrorKind::StorageUnavailable => 503,
            ErrorKind::Timeout => 504,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::StorageUnavailable)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::BadInput => "BadInput",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Forbidden => "Forbidden",
            ErrorKind::ConcCalculationFailed => "ConcCalculationFailed",
            ErrorKind::AlignedCorpusUnavailable => "AlignedCorpusUnavailable",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::Timeout => "Timeout",
            ErrorKind::StorageUnavailable => "StorageUnavailable",
            ErrorKind::Internal => "Internal",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Error {
    pub kind: ErrorKind,
    pub context: String,
}

impl Error {
    pub fn new(kind: ErrorKind, context: String) -> Self {
        Error { kind, context }
    }

    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.context)
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error {
            kind: ErrorKind::StorageUnavailable,
            context: err.to_string(),
        }
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error {
            kind: ErrorKind::StorageUnavailable,
            context: format!("corrupted state: {}", err),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            kind: ErrorKind::BadInput,
            context: format!("JSON error: {}", err),
        }
    }
}

impl From<rusqlite::Error> for Error {
    fn from(err: rusqlite::Error) -> Self {
        Error {
            kind: ErrorKind::StorageUnavailable,
            context: format!("SQLite error: {}", err),
        }
    }
}

impl From<regex::Error> for Error {
    fn from(err: regex::Error) -> Self {
        Error {
            kind: ErrorKind::BadInput,
            context: format!("invalid regular expression: {}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

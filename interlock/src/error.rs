//! Error and result types for the lifecycle core.

use interlock_api::{EngineError, StatusCode};

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("out of memory while tombstoning a statement")]
    OutOfMemory,
    #[error("statement handle is tombstoned; it only accepts release")]
    HandleInvalid,
    #[error("connection is closed")]
    Closed,
    #[error("invalid options: {0}")]
    Options(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// The status a host sees for this error.
    pub fn status(&self) -> StatusCode {
        match self {
            Error::Engine(err) => err.code,
            Error::OutOfMemory => StatusCode::NoMem,
            Error::HandleInvalid => StatusCode::Schema,
            Error::Closed | Error::Options(_) => StatusCode::Misuse,
            Error::Io(_) => StatusCode::Error,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.status() == StatusCode::Busy
    }
}

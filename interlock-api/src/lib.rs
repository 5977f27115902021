//! The boundary between the statement lifecycle guard and the database engine it wraps.
//!
//! Everything behind [`Engine`] is opaque to the guard: parsing, planning, the
//! virtual machine and storage all live on the other side of this trait.

use std::fmt;

/// Result codes shared by the engine, the guard and the C ABI.
///
/// Numbering follows SQLite so hosts that already speak that dialect can map
/// them without a translation table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusCode {
    Ok = 0,
    Error = 1,
    Busy = 5,
    NoMem = 7,
    /// The statement handle is tombstoned and only accepts a release call.
    Schema = 17,
    Misuse = 21,
    Range = 25,
    Row = 100,
    Done = 101,
}

impl StatusCode {
    pub const fn code(self) -> i32 {
        self as i32
    }

    /// Busy is the only status a caller is expected to retry.
    pub const fn is_transient(self) -> bool {
        matches!(self, Self::Busy)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ok => "not an error",
            Self::Error => "SQL logic error",
            Self::Busy => "database is locked",
            Self::NoMem => "out of memory",
            Self::Schema => "statement handle is invalid",
            Self::Misuse => "bad parameter or other API misuse",
            Self::Range => "column index out of range",
            Self::Row => "another row available",
            Self::Done => "no more rows available",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (code {})", .code.code())]
pub struct EngineError {
    pub code: StatusCode,
    pub message: String,
}

impl EngineError {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Busy, message)
    }

    pub fn misuse(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Misuse, message)
    }

    pub fn is_busy(&self) -> bool {
        self.code == StatusCode::Busy
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Float(f64),
    Text(String),
    Blob(Vec<u8>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Row,
    Done,
}

/// Primitives consumed from the wrapped engine.
///
/// `finalize` must be atomic: when it returns an error the statement body and
/// the connection's own bookkeeping are exactly as they were before the call.
/// `close` reports [`StatusCode::Busy`] while any statement prepared on the
/// connection has not been finalized.
pub trait Engine: Send + Sync + 'static {
    type Connection: Send + 'static;
    type Statement: Send + 'static;

    fn open(&self, path: &str) -> EngineResult<Self::Connection>;

    fn close(&self, conn: &mut Self::Connection) -> EngineResult<()>;

    fn prepare(&self, conn: &mut Self::Connection, sql: &str) -> EngineResult<Self::Statement>;

    fn finalize(&self, conn: &mut Self::Connection, stmt: &mut Self::Statement)
    -> EngineResult<()>;

    fn step(&self, stmt: &mut Self::Statement) -> EngineResult<Step>;

    fn reset(&self, stmt: &mut Self::Statement) -> EngineResult<()>;

    fn bind(&self, stmt: &mut Self::Statement, index: usize, value: Value) -> EngineResult<()>;

    fn column_count(&self, stmt: &Self::Statement) -> usize;

    fn column_value(&self, stmt: &Self::Statement, index: usize) -> Option<Value>;
}

//! Connection and statement lifecycle for embeddable database engines.
//!
//! A [`Connection`] can be force-closed while [`Statement`]s prepared on it are
//! still held by the host. Those statements are tombstoned: their engine
//! resources are finalized, their handles stay valid, and the only thing they
//! still accept is release.

mod connection;
mod error;
pub mod faultinject;
mod options;
mod statement;

use std::sync::{Mutex, MutexGuard, PoisonError};

pub use connection::Connection;
pub use error::{Error, Result};
pub use interlock_api::{Engine, EngineError, StatusCode, Step, Value};
pub use options::Options;
pub use statement::{HandleState, Statement, WeakStatement};

/// Lock a mutex, carrying on past a panic in another holder.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

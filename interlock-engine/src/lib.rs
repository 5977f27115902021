//! The bundled in-memory engine.
//!
//! It implements [`interlock_api::Engine`] with just enough machinery to drive
//! the statement lifecycle: a per-connection registry of open statements, a
//! scripted row source per statement, and fault injection for finalize, close
//! and step.

mod engine;
mod script;

pub use engine::{
    EngineStats, MemoryConnection, MemoryEngine, MemoryStatement, Phase, StatementId,
};
pub use script::{MAX_PARAM_INDEX, ScriptError};

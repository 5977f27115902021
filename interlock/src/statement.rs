//! Statement handles and the tombstone protocol.
//!
//! A handle's identity is the heap cell behind an `Arc`; its address never
//! changes for as long as anyone holds it. While Live the cell is shared by
//! the host's [`Statement`] and the owning connection's collection. A forced
//! close moves the engine body out into a freshly allocated block, finalizes
//! that block, and leaves the cell in the `Tombstoned` state with no owner and
//! no body. The host's eventual release then only has to drop its reference.

use crate::connection::Shared;
use crate::error::{Error, Result};
use crate::{faultinject, lock};
use interlock_api::{Engine, Step, Value};
use rand::Rng;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

pub(crate) enum SlotState<E: Engine> {
    Live {
        owner: Arc<Shared<E>>,
        body: E::Statement,
    },
    Tombstoned,
    Finalized,
}

pub(crate) struct StmtCell<E: Engine> {
    sql: String,
    state: Mutex<SlotState<E>>,
}

impl<E: Engine> StmtCell<E> {
    pub(crate) fn live(sql: &str, owner: Arc<Shared<E>>, body: E::Statement) -> Arc<Self> {
        Arc::new(Self {
            sql: sql.to_string(),
            state: Mutex::new(SlotState::Live { owner, body }),
        })
    }

    pub(crate) fn is_live(&self) -> bool {
        matches!(&*lock(&self.state), SlotState::Live { .. })
    }

    /// Finalize through the engine after the host's release, under the owning
    /// connection's mutex. On failure the handle stays Live and stays in the
    /// connection's collection.
    pub(crate) fn finalize_live(
        self: &Arc<Self>,
        engine: &E,
        ctx: &mut E::Connection,
    ) -> Result<bool> {
        let mut state = lock(&self.state);
        let SlotState::Live { body, .. } = &mut *state else {
            return Ok(false);
        };
        engine.finalize(ctx, body)?;
        *state = SlotState::Finalized;
        Ok(true)
    }
}

/// A block allocated for a statement body on its way to the engine's finalize.
/// Always holds exactly one body.
struct Duplicate<T> {
    block: Vec<T>,
}

impl<T> Duplicate<T> {
    /// Moves `body` into a fresh allocation, handing it back untouched if the
    /// allocator is exhausted.
    fn allocate(body: T) -> std::result::Result<Self, T> {
        if faultinject::take_allocation_failure() {
            return Err(body);
        }
        let mut block = Vec::new();
        if block.try_reserve_exact(1).is_err() {
            return Err(body);
        }
        block.push(body);
        Ok(Self { block })
    }

    fn body_mut(&mut self) -> &mut T {
        &mut self.block[0]
    }

    fn into_inner(mut self) -> T {
        self.block.swap_remove(0)
    }
}

/// Turn a Live handle into a tombstone. The caller holds the owning
/// connection's mutex and passes its engine context.
///
/// Either the whole transformation happens or the handle is put back exactly
/// as it was and the error is returned.
pub(crate) fn tombstone<E: Engine>(
    engine: &E,
    ctx: &mut E::Connection,
    cell: &StmtCell<E>,
) -> Result<()> {
    let mut state = lock(&cell.state);
    let (owner, body) = match std::mem::replace(&mut *state, SlotState::Tombstoned) {
        SlotState::Live { owner, body } => (owner, body),
        other => {
            *state = other;
            return Ok(());
        }
    };

    let mut duplicate = match Duplicate::allocate(body) {
        Ok(duplicate) => duplicate,
        Err(body) => {
            *state = SlotState::Live { owner, body };
            tracing::warn!(sql = %cell.sql, "no memory to tombstone statement; left live");
            return Err(Error::OutOfMemory);
        }
    };

    match engine.finalize(ctx, duplicate.body_mut()) {
        Ok(()) => {
            drop(duplicate);
            drop(owner);
            tracing::trace!(sql = %cell.sql, "statement tombstoned");
            Ok(())
        }
        Err(err) => {
            *state = SlotState::Live {
                owner,
                body: duplicate.into_inner(),
            };
            tracing::warn!(sql = %cell.sql, error = %err, "finalize failed; tombstone rolled back");
            Err(err.into())
        }
    }
}

fn release_cell<E: Engine>(cell: &Arc<StmtCell<E>>) -> Result<()> {
    let owner = match &*lock(&cell.state) {
        SlotState::Live { owner, .. } => Arc::clone(owner),
        SlotState::Tombstoned => {
            tracing::trace!(sql = %cell.sql, "released tombstoned statement");
            return Ok(());
        }
        SlotState::Finalized => return Ok(()),
    };
    owner.finalize_statement(cell)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Live,
    /// Finalized by a forced close; only release is accepted.
    Tombstoned,
    /// Finalized through the ordinary release path. A [`Statement`] never
    /// reports this itself, since releasing consumes it.
    Finalized,
}

/// The host's handle to a prepared statement.
///
/// Releasing it, explicitly with [`Statement::release`] or implicitly by
/// dropping it, is the one cleanup call regardless of whether the statement
/// is still Live or was tombstoned by a forced close.
pub struct Statement<E: Engine> {
    cell: Arc<StmtCell<E>>,
    released: bool,
}

impl<E: Engine> Statement<E> {
    pub(crate) fn new(cell: Arc<StmtCell<E>>) -> Self {
        Self {
            cell,
            released: false,
        }
    }

    pub(crate) fn cell(&self) -> &Arc<StmtCell<E>> {
        &self.cell
    }

    /// SQL text the statement was prepared from. Survives tombstoning.
    pub fn sql(&self) -> &str {
        &self.cell.sql
    }

    pub fn state(&self) -> HandleState {
        match &*lock(&self.cell.state) {
            SlotState::Live { .. } => HandleState::Live,
            SlotState::Tombstoned => HandleState::Tombstoned,
            SlotState::Finalized => HandleState::Finalized,
        }
    }

    pub fn is_tombstoned(&self) -> bool {
        self.state() == HandleState::Tombstoned
    }

    fn with_live<R>(
        &self,
        f: impl FnOnce(&Shared<E>, &mut E::Statement) -> Result<R>,
    ) -> Result<R> {
        let mut state = lock(&self.cell.state);
        match &mut *state {
            SlotState::Live { owner, body } => f(owner, body),
            SlotState::Tombstoned | SlotState::Finalized => Err(Error::HandleInvalid),
        }
    }

    /// Advance to the next row. Returns `false` once the statement is done.
    ///
    /// Busy from the engine is retried with a random pause until the
    /// connection's busy timeout runs out; the handle's lock is not held
    /// while waiting.
    pub fn step(&self) -> Result<bool> {
        let started = Instant::now();
        loop {
            let (outcome, timeout, max_sleep) = self.with_live(|shared, body| {
                let options = shared.options();
                Ok((
                    shared.engine().step(body),
                    options.busy_timeout(),
                    options.max_busy_sleep(),
                ))
            })?;

            match outcome {
                Ok(Step::Row) => return Ok(true),
                Ok(Step::Done) => return Ok(false),
                Err(err) if err.code.is_transient() && started.elapsed() < timeout => {
                    let pause = rand::thread_rng().gen_range(1..=max_sleep);
                    tracing::trace!(pause_ms = pause, "statement busy; retrying");
                    std::thread::sleep(Duration::from_millis(pause).min(timeout));
                }
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Rewind the statement. A tombstoned handle fails with
    /// [`Error::HandleInvalid`] without touching its buffers.
    pub fn reset(&self) -> Result<()> {
        self.with_live(|shared, body| Ok(shared.engine().reset(body)?))
    }

    /// Bind a parameter (1-based).
    pub fn bind(&self, index: usize, value: Value) -> Result<()> {
        self.with_live(|shared, body| Ok(shared.engine().bind(body, index, value)?))
    }

    pub fn bind_values(&self, values: &[Value]) -> Result<()> {
        for (offset, value) in values.iter().enumerate() {
            self.bind(offset + 1, value.clone())?;
        }
        Ok(())
    }

    pub fn column_count(&self) -> Result<usize> {
        self.with_live(|shared, body| Ok(shared.engine().column_count(body)))
    }

    pub fn column_value(&self, index: usize) -> Result<Option<Value>> {
        self.with_live(|shared, body| Ok(shared.engine().column_value(body, index)))
    }

    pub fn row_values(&self) -> Result<Vec<Value>> {
        self.with_live(|shared, body| {
            let engine = shared.engine();
            let count = engine.column_count(body);
            Ok((0..count)
                .map(|i| engine.column_value(body, i).unwrap_or(Value::Null))
                .collect())
        })
    }

    /// Read-only access to the engine-private body of a Live handle.
    pub fn inspect<R>(&self, f: impl FnOnce(&E::Statement) -> R) -> Result<R> {
        self.with_live(|_, body| Ok(f(body)))
    }

    pub fn downgrade(&self) -> WeakStatement<E> {
        WeakStatement {
            cell: Arc::downgrade(&self.cell),
        }
    }

    /// Release the handle. A Live statement is finalized through the engine;
    /// a tombstoned one is simply freed.
    ///
    /// If the engine refuses to finalize a Live statement the error is
    /// returned and the connection keeps the statement; a later forced close
    /// tombstones and frees it.
    pub fn release(mut self) -> Result<()> {
        self.released = true;
        release_cell(&self.cell)
    }
}

impl<E: Engine> Drop for Statement<E> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = release_cell(&self.cell) {
            tracing::warn!(sql = %self.cell.sql, error = %err, "dropped statement failed to finalize");
        }
    }
}

impl<E: Engine> fmt::Debug for Statement<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Statement")
            .field("sql", &self.cell.sql)
            .field("state", &self.state())
            .finish()
    }
}

/// Observes whether a statement's slot has been freed.
pub struct WeakStatement<E: Engine> {
    cell: Weak<StmtCell<E>>,
}

impl<E: Engine> WeakStatement<E> {
    pub fn is_released(&self) -> bool {
        self.cell.strong_count() == 0
    }
}

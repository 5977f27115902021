use crate::error::{Error, Result};
use crate::lock;
use crate::options::Options;
use crate::statement::{self, Statement, StmtCell};
use interlock_api::Engine;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};

struct Inner<E: Engine> {
    /// `None` once the engine has closed the connection.
    context: Option<E::Connection>,
    /// Every Live statement prepared on this connection, oldest first.
    statements: VecDeque<Arc<StmtCell<E>>>,
}

pub(crate) struct Shared<E: Engine> {
    engine: Arc<E>,
    options: Options,
    inner: Mutex<Inner<E>>,
}

impl<E: Engine> Shared<E> {
    #[inline]
    pub(crate) fn engine(&self) -> &E {
        &self.engine
    }

    #[inline]
    pub(crate) fn options(&self) -> &Options {
        &self.options
    }

    fn close(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        let ctx = inner.context.as_mut().ok_or(Error::Closed)?;
        self.engine.close(ctx)?;
        inner.context = None;
        Ok(())
    }

    /// Close the connection even though statements are still outstanding.
    ///
    /// Runs entirely under the connection mutex. When the engine reports
    /// Busy every Live statement is tombstoned, oldest first, and the close
    /// is retried. A failed tombstone puts its statement back at the front of
    /// the collection and ends the call with the connection still open;
    /// statements tombstoned before it stay tombstoned.
    fn force_close(&self) -> Result<()> {
        let mut inner = lock(&self.inner);
        let Inner {
            context,
            statements,
        } = &mut *inner;
        let ctx = context.as_mut().ok_or(Error::Closed)?;

        match self.engine.close(ctx) {
            Ok(()) => {
                *context = None;
                return Ok(());
            }
            Err(err) if err.is_busy() && !statements.is_empty() => {
                tracing::debug!(
                    outstanding = statements.len(),
                    "close is busy; tombstoning outstanding statements"
                );
            }
            Err(err) => return Err(err.into()),
        }

        while let Some(cell) = statements.pop_front() {
            if let Err(err) = statement::tombstone(self.engine(), ctx, &cell) {
                statements.push_front(cell);
                return Err(err);
            }
        }

        self.engine.close(ctx)?;
        *context = None;
        Ok(())
    }

    /// Ordinary finalize of a Live statement the host has released. Whoever
    /// takes the connection mutex first, this or a forced close, decides the
    /// statement's fate; the other finds it no longer Live.
    pub(crate) fn finalize_statement(&self, cell: &Arc<StmtCell<E>>) -> Result<()> {
        let mut inner = lock(&self.inner);
        let Inner {
            context,
            statements,
        } = &mut *inner;
        let Some(ctx) = context.as_mut() else {
            return if cell.is_live() {
                Err(Error::Closed)
            } else {
                Ok(())
            };
        };

        if cell.finalize_live(self.engine(), ctx)? {
            statements.retain(|other| !Arc::ptr_eq(other, cell));
        }
        Ok(())
    }
}

impl<E: Engine> Drop for Shared<E> {
    fn drop(&mut self) {
        let inner = self
            .inner
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if let Some(ctx) = inner.context.as_mut() {
            if let Err(err) = self.engine.close(ctx) {
                tracing::warn!(error = %err, "engine refused to close an abandoned connection");
            }
        }
    }
}

/// A database connection that can be shut down while statements prepared on
/// it are still held elsewhere.
pub struct Connection<E: Engine> {
    shared: Arc<Shared<E>>,
}

impl<E: Engine> Connection<E> {
    pub fn open(engine: Arc<E>, path: &str, options: Options) -> Result<Self> {
        let context = engine.open(path)?;
        tracing::debug!(path, "connection opened");
        Ok(Self {
            shared: Arc::new(Shared {
                engine,
                options,
                inner: Mutex::new(Inner {
                    context: Some(context),
                    statements: VecDeque::new(),
                }),
            }),
        })
    }

    pub fn open_in_memory(engine: Arc<E>) -> Result<Self> {
        Self::open(engine, ":memory:", Options::default())
    }

    pub fn prepare(&self, sql: &str) -> Result<Statement<E>> {
        let mut inner = lock(&self.shared.inner);
        let ctx = inner.context.as_mut().ok_or(Error::Closed)?;
        let body = self.shared.engine.prepare(ctx, sql)?;

        let cell = StmtCell::live(sql, Arc::clone(&self.shared), body);
        inner.statements.push_back(Arc::clone(&cell));
        Ok(Statement::new(cell))
    }

    /// Prepare a fresh statement from the SQL of `stmt`, which may be Live or
    /// tombstoned.
    pub fn reprepare(&self, stmt: &Statement<E>) -> Result<Statement<E>> {
        self.prepare(stmt.sql())
    }

    /// The engine's ordinary close. Busy is returned as is while statements
    /// are outstanding; see [`Connection::force_close`].
    pub fn close(&self) -> Result<()> {
        self.shared.close()
    }

    /// Close the connection, tombstoning any statements that are still
    /// outstanding. Those handles then only accept release.
    ///
    /// A second call fails with [`Error::Closed`] without reaching the engine.
    pub fn force_close(&self) -> Result<()> {
        self.shared.force_close()
    }

    pub fn is_open(&self) -> bool {
        lock(&self.shared.inner).context.is_some()
    }

    /// Number of Live statements registered on the connection.
    pub fn outstanding_statements(&self) -> usize {
        lock(&self.shared.inner).statements.len()
    }

    /// Whether `stmt` is among this connection's outstanding statements.
    pub fn owns(&self, stmt: &Statement<E>) -> bool {
        lock(&self.shared.inner)
            .statements
            .iter()
            .any(|cell| Arc::ptr_eq(cell, stmt.cell()))
    }

    pub fn engine(&self) -> &Arc<E> {
        &self.shared.engine
    }

    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Read-only access to the engine's connection context while open.
    pub fn inspect_context<R>(&self, f: impl FnOnce(&E::Connection) -> R) -> Result<R> {
        let inner = lock(&self.shared.inner);
        inner.context.as_ref().map(f).ok_or(Error::Closed)
    }
}

impl<E: Engine> Drop for Connection<E> {
    fn drop(&mut self) {
        if !self.shared.options.close_on_drop || !self.is_open() {
            return;
        }
        if let Err(err) = self.shared.force_close() {
            tracing::warn!(error = %err, "failed to force-close dropped connection");
        }
    }
}

impl<E: Engine> fmt::Debug for Connection<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = lock(&self.shared.inner);
        f.debug_struct("Connection")
            .field("open", &inner.context.is_some())
            .field("outstanding", &inner.statements.len())
            .field("options", &self.shared.options)
            .finish()
    }
}

use crate::script::Program;
use interlock_api::{Engine, EngineError, EngineResult, StatusCode, Step, Value};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};

pub type StatementId = u64;

#[derive(Debug, Default)]
struct FaultPlan {
    finalize: VecDeque<EngineError>,
    finalize_of: BTreeMap<StatementId, EngineError>,
    close: VecDeque<EngineError>,
    busy_steps: u32,
}

/// Lifetime counters, mostly useful to assert "finalized exactly once".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub opened: u64,
    pub prepared: u64,
    pub finalized: u64,
    pub closed: u64,
}

#[derive(Debug, Default)]
pub struct MemoryEngine {
    faults: Mutex<FaultPlan>,
    next_stmt_id: AtomicU64,

    opened: AtomicU64,
    prepared: AtomicU64,
    finalized: AtomicU64,
    closed: AtomicU64,
}

#[derive(Debug)]
pub struct MemoryConnection {
    path: String,
    open_statements: BTreeSet<StatementId>,
    closed: bool,
}

impl MemoryConnection {
    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn open_statement_count(&self) -> usize {
        self.open_statements.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Ready,
    Running,
    Done,
    Finalized,
}

/// Execution buffers of one prepared statement.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryStatement {
    id: StatementId,
    program: Program,
    params: Vec<Value>,
    pc: usize,
    current: Vec<Value>,
    phase: Phase,
}

impl MemoryStatement {
    #[inline]
    pub fn id(&self) -> StatementId {
        self.id
    }

    #[inline]
    pub fn phase(&self) -> Phase {
        self.phase
    }
}

impl MemoryEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an error for the next `finalize` call. Failed finalizes leave
    /// the statement registered and untouched.
    pub fn inject_finalize_failure(&self, err: EngineError) {
        self.faults().finalize.push_back(err);
    }

    /// Like [`MemoryEngine::inject_finalize_failure`], but only for the
    /// statement with the given id.
    pub fn inject_finalize_failure_for(&self, id: StatementId, err: EngineError) {
        self.faults().finalize_of.insert(id, err);
    }

    pub fn inject_close_failure(&self, err: EngineError) {
        self.faults().close.push_back(err);
    }

    /// The next `count` calls to `step` report [`StatusCode::Busy`].
    pub fn inject_busy_steps(&self, count: u32) {
        self.faults().busy_steps = count;
    }

    pub fn stats(&self) -> EngineStats {
        EngineStats {
            opened: self.opened.load(Ordering::SeqCst),
            prepared: self.prepared.load(Ordering::SeqCst),
            finalized: self.finalized.load(Ordering::SeqCst),
            closed: self.closed.load(Ordering::SeqCst),
        }
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, FaultPlan> {
        self.faults.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn ensure_not_finalized(stmt: &MemoryStatement) -> EngineResult<()> {
    if stmt.phase == Phase::Finalized {
        return Err(EngineError::misuse("statement has been finalized"));
    }
    Ok(())
}

impl Engine for MemoryEngine {
    type Connection = MemoryConnection;
    type Statement = MemoryStatement;

    fn open(&self, path: &str) -> EngineResult<MemoryConnection> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(path, "opened in-memory connection");
        Ok(MemoryConnection {
            path: path.to_string(),
            open_statements: BTreeSet::new(),
            closed: false,
        })
    }

    fn close(&self, conn: &mut MemoryConnection) -> EngineResult<()> {
        if conn.closed {
            return Err(EngineError::misuse("connection is already closed"));
        }
        if let Some(err) = self.faults().close.pop_front() {
            return Err(err);
        }
        if !conn.open_statements.is_empty() {
            return Err(EngineError::busy(
                "unable to close due to unfinalized statements",
            ));
        }

        conn.closed = true;
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn prepare(&self, conn: &mut MemoryConnection, sql: &str) -> EngineResult<MemoryStatement> {
        if conn.closed {
            return Err(EngineError::misuse("connection is closed"));
        }
        let program =
            Program::parse(sql).map_err(|e| EngineError::new(StatusCode::Error, e.to_string()))?;

        let id = self.next_stmt_id.fetch_add(1, Ordering::Relaxed) + 1;
        conn.open_statements.insert(id);
        self.prepared.fetch_add(1, Ordering::SeqCst);
        tracing::trace!(statement = id, rows = program.len(), "prepared statement");

        Ok(MemoryStatement {
            id,
            params: vec![Value::Null; program.param_count()],
            program,
            pc: 0,
            current: Vec::new(),
            phase: Phase::Ready,
        })
    }

    fn finalize(&self, conn: &mut MemoryConnection, stmt: &mut MemoryStatement) -> EngineResult<()> {
        ensure_not_finalized(stmt)?;
        {
            let mut faults = self.faults();
            if let Some(err) = faults.finalize_of.remove(&stmt.id) {
                return Err(err);
            }
            if let Some(err) = faults.finalize.pop_front() {
                return Err(err);
            }
        }
        if !conn.open_statements.remove(&stmt.id) {
            return Err(EngineError::misuse(
                "statement does not belong to this connection",
            ));
        }

        stmt.phase = Phase::Finalized;
        stmt.params.clear();
        stmt.current.clear();
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn step(&self, stmt: &mut MemoryStatement) -> EngineResult<Step> {
        ensure_not_finalized(stmt)?;
        {
            let mut faults = self.faults();
            if faults.busy_steps > 0 {
                faults.busy_steps -= 1;
                return Err(EngineError::busy("database is locked"));
            }
        }

        match stmt.program.eval_row(stmt.pc, &stmt.params) {
            Some(row) => {
                stmt.current = row;
                stmt.pc += 1;
                stmt.phase = Phase::Running;
                Ok(Step::Row)
            }
            None => {
                stmt.current.clear();
                stmt.phase = Phase::Done;
                Ok(Step::Done)
            }
        }
    }

    fn reset(&self, stmt: &mut MemoryStatement) -> EngineResult<()> {
        ensure_not_finalized(stmt)?;
        stmt.pc = 0;
        stmt.current.clear();
        stmt.phase = Phase::Ready;
        Ok(())
    }

    fn bind(&self, stmt: &mut MemoryStatement, index: usize, value: Value) -> EngineResult<()> {
        ensure_not_finalized(stmt)?;
        if stmt.phase == Phase::Running {
            return Err(EngineError::misuse(
                "cannot bind parameters while the statement is running",
            ));
        }
        let slot = index
            .checked_sub(1)
            .and_then(|slot| stmt.params.get_mut(slot))
            .ok_or_else(|| {
                EngineError::new(
                    StatusCode::Range,
                    format!("parameter index {index} out of range"),
                )
            })?;
        *slot = value;
        Ok(())
    }

    fn column_count(&self, stmt: &MemoryStatement) -> usize {
        if stmt.current.is_empty() {
            stmt.program.width()
        } else {
            stmt.current.len()
        }
    }

    fn column_value(&self, stmt: &MemoryStatement, index: usize) -> Option<Value> {
        stmt.current.get(index).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open() -> (MemoryEngine, MemoryConnection) {
        let engine = MemoryEngine::new();
        let conn = engine.open(":memory:").expect("open");
        (engine, conn)
    }

    #[test]
    fn step_walks_rows_then_reports_done() {
        let (engine, mut conn) = open();
        let mut stmt = engine
            .prepare(&mut conn, r#"[[1, "apples"], [2, "pears"]]"#)
            .expect("prepare");

        assert_eq!(engine.step(&mut stmt).expect("step"), Step::Row);
        assert_eq!(
            engine.column_value(&stmt, 1),
            Some(Value::Text("apples".to_string()))
        );
        assert_eq!(engine.step(&mut stmt).expect("step"), Step::Row);
        assert_eq!(engine.step(&mut stmt).expect("step"), Step::Done);
        assert_eq!(stmt.phase(), Phase::Done);

        engine.reset(&mut stmt).expect("reset");
        assert_eq!(stmt.phase(), Phase::Ready);
        assert_eq!(engine.step(&mut stmt).expect("step"), Step::Row);
        assert_eq!(engine.column_value(&stmt, 0), Some(Value::Integer(1)));
    }

    #[test]
    fn bind_substitutes_params_and_checks_range() {
        let (engine, mut conn) = open();
        let mut stmt = engine
            .prepare(&mut conn, r#"[[{"param": 1}, {"param": 2}]]"#)
            .expect("prepare");

        engine
            .bind(&mut stmt, 1, Value::Integer(41))
            .expect("bind first");
        engine
            .bind(&mut stmt, 2, Value::Text("hello".to_string()))
            .expect("bind second");
        let err = engine
            .bind(&mut stmt, 3, Value::Null)
            .expect_err("index 3 is out of range");
        assert_eq!(err.code, StatusCode::Range);

        engine.step(&mut stmt).expect("step");
        assert_eq!(engine.column_value(&stmt, 0), Some(Value::Integer(41)));

        let err = engine
            .bind(&mut stmt, 1, Value::Null)
            .expect_err("running statement refuses binds");
        assert_eq!(err.code, StatusCode::Misuse);
    }

    #[test]
    fn close_is_busy_until_statements_are_finalized() {
        let (engine, mut conn) = open();
        let mut stmt = engine.prepare(&mut conn, "[[1]]").expect("prepare");

        let err = engine.close(&mut conn).expect_err("busy");
        assert!(err.is_busy());
        assert_eq!(conn.open_statement_count(), 1);

        engine.finalize(&mut conn, &mut stmt).expect("finalize");
        assert_eq!(stmt.phase(), Phase::Finalized);
        engine.close(&mut conn).expect("close");

        let err = engine.close(&mut conn).expect_err("second close");
        assert_eq!(err.code, StatusCode::Misuse);
        assert_eq!(
            engine.stats(),
            EngineStats {
                opened: 1,
                prepared: 1,
                finalized: 1,
                closed: 1
            }
        );
    }

    #[test]
    fn failed_finalize_leaves_statement_registered_and_unchanged() {
        let (engine, mut conn) = open();
        let mut stmt = engine.prepare(&mut conn, "[[1], [2]]").expect("prepare");
        engine.step(&mut stmt).expect("step");
        let before = stmt.clone();

        engine.inject_finalize_failure(EngineError::new(StatusCode::Error, "disk I/O error"));
        let err = engine
            .finalize(&mut conn, &mut stmt)
            .expect_err("injected failure");
        assert_eq!(err.message, "disk I/O error");
        assert_eq!(stmt, before);
        assert_eq!(conn.open_statement_count(), 1);

        engine.finalize(&mut conn, &mut stmt).expect("finalize");
        assert_eq!(conn.open_statement_count(), 0);
    }

    #[test]
    fn targeted_finalize_failure_hits_one_statement() {
        let (engine, mut conn) = open();
        let mut first = engine.prepare(&mut conn, "[]").expect("prepare");
        let mut second = engine.prepare(&mut conn, "[]").expect("prepare");
        engine.inject_finalize_failure_for(second.id(), EngineError::busy("locked"));

        engine.finalize(&mut conn, &mut first).expect("first finalizes");
        assert!(engine.finalize(&mut conn, &mut second).expect_err("targeted").is_busy());
        engine.finalize(&mut conn, &mut second).expect("fault is consumed");
    }

    #[test]
    fn finalize_rejects_foreign_statement() {
        let engine = MemoryEngine::new();
        let mut a = engine.open("a").expect("open a");
        let mut b = engine.open("b").expect("open b");
        let mut stmt = engine.prepare(&mut a, "[]").expect("prepare");

        let err = engine
            .finalize(&mut b, &mut stmt)
            .expect_err("foreign statement");
        assert_eq!(err.code, StatusCode::Misuse);
        assert_eq!(a.open_statement_count(), 1);
    }

    #[test]
    fn injected_busy_steps_drain() {
        let (engine, mut conn) = open();
        let mut stmt = engine.prepare(&mut conn, "[[1]]").expect("prepare");
        engine.inject_busy_steps(2);

        assert!(engine.step(&mut stmt).expect_err("busy").is_busy());
        assert!(engine.step(&mut stmt).expect_err("busy").is_busy());
        assert_eq!(engine.step(&mut stmt).expect("step"), Step::Row);
    }

    #[test]
    fn prepare_rejects_oversized_parameter_index() {
        let (engine, mut conn) = open();
        let err = engine
            .prepare(&mut conn, r#"[[{"param": 4000000000000}]]"#)
            .expect_err("index beyond the limit");
        assert_eq!(err.code, StatusCode::Error);
        assert_eq!(conn.open_statement_count(), 0);
        assert_eq!(engine.stats().prepared, 0);
    }

    #[test]
    fn prepare_reports_script_errors() {
        let (engine, mut conn) = open();
        let err = engine
            .prepare(&mut conn, "select * from t")
            .expect_err("not a script");
        assert_eq!(err.code, StatusCode::Error);
        assert!(err.message.starts_with("malformed statement"));
        assert_eq!(conn.open_statement_count(), 0);
    }
}

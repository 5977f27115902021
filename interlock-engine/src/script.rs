//! Statement text for the in-memory engine.
//!
//! A statement is a JSON array of rows. Each cell is a literal or a parameter
//! reference `{"param": N}` (1-based), e.g. `[[1, "alice"], [2, {"param": 1}]]`.

use interlock_api::Value;
use serde_json::Value as JsonValue;

/// Highest parameter index a statement may reference, SQLite's default
/// `SQLITE_MAX_VARIABLE_NUMBER`.
pub const MAX_PARAM_INDEX: usize = 32766;

#[derive(Debug, thiserror::Error)]
pub enum ScriptError {
    #[error("malformed statement: {0}")]
    Json(#[from] serde_json::Error),
    #[error("statement must be a JSON array of rows")]
    NotRows,
    #[error("row {row} must be a JSON array")]
    NotARow { row: usize },
    #[error("unsupported value at row {row}, column {column}")]
    BadCell { row: usize, column: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Cell {
    Literal(Value),
    Param(usize),
}

#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct Program {
    rows: Vec<Vec<Cell>>,
}

impl Program {
    pub(crate) fn parse(sql: &str) -> Result<Self, ScriptError> {
        let root: JsonValue = serde_json::from_str(sql)?;
        let JsonValue::Array(items) = root else {
            return Err(ScriptError::NotRows);
        };

        let mut rows = Vec::with_capacity(items.len());
        for (row, item) in items.iter().enumerate() {
            let JsonValue::Array(cells) = item else {
                return Err(ScriptError::NotARow { row });
            };
            let mut out = Vec::with_capacity(cells.len());
            for (column, cell) in cells.iter().enumerate() {
                out.push(cell_from_json(cell).ok_or(ScriptError::BadCell { row, column })?);
            }
            rows.push(out);
        }

        Ok(Self { rows })
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.len()
    }

    pub(crate) fn width(&self) -> usize {
        self.rows.first().map_or(0, Vec::len)
    }

    /// Highest parameter index referenced anywhere in the program.
    pub(crate) fn param_count(&self) -> usize {
        self.rows
            .iter()
            .flatten()
            .filter_map(|cell| match cell {
                Cell::Param(index) => Some(*index),
                Cell::Literal(_) => None,
            })
            .max()
            .unwrap_or(0)
    }

    pub(crate) fn eval_row(&self, row: usize, params: &[Value]) -> Option<Vec<Value>> {
        let cells = self.rows.get(row)?;
        Some(
            cells
                .iter()
                .map(|cell| match cell {
                    Cell::Literal(value) => value.clone(),
                    Cell::Param(index) => index
                        .checked_sub(1)
                        .and_then(|slot| params.get(slot))
                        .cloned()
                        .unwrap_or(Value::Null),
                })
                .collect(),
        )
    }
}

fn cell_from_json(value: &JsonValue) -> Option<Cell> {
    let literal = match value {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Integer(i64::from(*b)),
        JsonValue::Number(n) => {
            if let Some(i) = n.as_i64() {
                Value::Integer(i)
            } else {
                Value::Float(n.as_f64()?)
            }
        }
        JsonValue::String(s) => Value::Text(s.clone()),
        JsonValue::Object(map) => {
            if map.len() != 1 {
                return None;
            }
            let index = map.get("param")?.as_u64()?;
            let index = usize::try_from(index)
                .ok()
                .filter(|i| (1..=MAX_PARAM_INDEX).contains(i))?;
            return Some(Cell::Param(index));
        }
        JsonValue::Array(_) => return None,
    };
    Some(Cell::Literal(literal))
}

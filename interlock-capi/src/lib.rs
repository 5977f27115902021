#![allow(clippy::not_unsafe_ptr_arg_deref)]

use interlock::{Connection, Options, Statement, Value};
use interlock_engine::MemoryEngine;
use serde_json::{Value as JsonValue, json};
use std::cell::RefCell;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;
use std::sync::Arc;

pub const IC_OK: c_int = 0;
pub const IC_ERROR: c_int = 1;
pub const IC_BUSY: c_int = 5;
pub const IC_NOMEM: c_int = 7;
pub const IC_SCHEMA: c_int = 17;
pub const IC_MISUSE: c_int = 21;
pub const IC_RANGE: c_int = 25;
pub const IC_ROW: c_int = 100;
pub const IC_DONE: c_int = 101;

#[repr(C)]
pub struct ic_db_t {
    _private: [u8; 0],
}

#[repr(C)]
pub struct ic_stmt_t {
    _private: [u8; 0],
}

struct DbHandle {
    conn: Connection<MemoryEngine>,
}

struct StmtHandle {
    stmt: Statement<MemoryEngine>,
}

#[derive(Clone, Default)]
struct LastError {
    code: c_int,
    message: String,
}

#[derive(Debug)]
struct ApiError {
    code: c_int,
    message: String,
}

type ApiResult<T> = Result<T, ApiError>;

thread_local! {
    static LAST_ERROR: RefCell<LastError> = RefCell::new(LastError::default());
}

impl ApiError {
    fn new(code: c_int, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    fn invalid(message: impl Into<String>) -> Self {
        Self::new(IC_MISUSE, message)
    }

    fn null_pointer(name: &str) -> Self {
        Self::new(IC_MISUSE, format!("{name} is null"))
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(IC_ERROR, message)
    }

    fn from_core(err: interlock::Error) -> Self {
        Self::new(err.status().code(), err.to_string())
    }
}

fn clear_last_error() {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = LastError::default();
    });
}

fn set_last_error(err: &ApiError) {
    LAST_ERROR.with(|slot| {
        *slot.borrow_mut() = LastError {
            code: err.code,
            message: err.message.clone(),
        };
    });
}

fn ok_status() -> c_int {
    clear_last_error();
    IC_OK
}

fn err_status(err: ApiError) -> c_int {
    set_last_error(&err);
    err.code
}

fn cstr_to_string(ptr: *const c_char, name: &str) -> ApiResult<String> {
    if ptr.is_null() {
        return Err(ApiError::null_pointer(name));
    }
    let c = unsafe {
        // SAFETY: caller passed a non-null pointer and C ABI contract requires a valid C string.
        CStr::from_ptr(ptr)
    };
    c.to_str()
        .map(|s| s.to_string())
        .map_err(|_| ApiError::invalid(format!("{name} must be valid UTF-8")))
}

fn write_out_c_string(out: *mut *mut c_char, text: &str) -> ApiResult<()> {
    if out.is_null() {
        return Err(ApiError::null_pointer("out"));
    }
    let c = CString::new(text).map_err(|_| ApiError::internal("string contains interior NUL"))?;
    unsafe {
        // SAFETY: caller provided a valid output pointer.
        *out = c.into_raw();
    }
    Ok(())
}

fn value_to_json(value: Value) -> JsonValue {
    match value {
        Value::Null => JsonValue::Null,
        Value::Integer(i) => json!(i),
        Value::Float(f) => serde_json::Number::from_f64(f)
            .map(JsonValue::Number)
            .unwrap_or(JsonValue::Null),
        Value::Text(s) => JsonValue::String(s),
        Value::Blob(bytes) => json!(bytes),
    }
}

unsafe fn db_handle_ref<'a>(db: *mut ic_db_t) -> ApiResult<&'a DbHandle> {
    if db.is_null() {
        return Err(ApiError::null_pointer("db"));
    }
    Ok(unsafe {
        // SAFETY: pointer validity is ensured by FFI lifecycle; all handles are allocated by this crate.
        &*db.cast::<DbHandle>()
    })
}

unsafe fn stmt_handle_ref<'a>(stmt: *mut ic_stmt_t) -> ApiResult<&'a StmtHandle> {
    if stmt.is_null() {
        return Err(ApiError::null_pointer("stmt"));
    }
    Ok(unsafe {
        // SAFETY: pointer validity is ensured by FFI lifecycle; all handles are allocated by this crate.
        &*stmt.cast::<StmtHandle>()
    })
}

fn open_with(path: *const c_char, options: Options, out_db: *mut *mut ic_db_t) -> ApiResult<()> {
    if out_db.is_null() {
        return Err(ApiError::null_pointer("out_db"));
    }
    let path = cstr_to_string(path, "path")?;
    let engine = Arc::new(MemoryEngine::new());
    let conn = Connection::open(engine, &path, options).map_err(ApiError::from_core)?;
    let handle = Box::new(DbHandle { conn });
    unsafe {
        // SAFETY: out pointer validated above.
        *out_db = Box::into_raw(handle).cast::<ic_db_t>();
    }
    Ok(())
}

#[unsafe(no_mangle)]
pub extern "C" fn ic_last_error_code() -> c_int {
    LAST_ERROR.with(|slot| slot.borrow().code)
}

#[unsafe(no_mangle)]
pub extern "C" fn ic_last_error_message(buf: *mut c_char, len: usize) -> usize {
    let message = LAST_ERROR.with(|slot| slot.borrow().message.clone());
    let bytes = message.as_bytes();
    if buf.is_null() || len == 0 {
        return bytes.len();
    }

    let copy_len = bytes.len().min(len.saturating_sub(1));
    unsafe {
        // SAFETY: caller provided writable buffer of at least `len` bytes.
        ptr::copy_nonoverlapping(bytes.as_ptr().cast::<c_char>(), buf, copy_len);
        *buf.add(copy_len) = 0;
    }
    bytes.len()
}

#[unsafe(no_mangle)]
pub extern "C" fn ic_string_free(s: *mut c_char) {
    if s.is_null() {
        return;
    }
    unsafe {
        // SAFETY: pointer was allocated via CString::into_raw by this crate.
        drop(CString::from_raw(s));
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn ic_open(path: *const c_char, out_db: *mut *mut ic_db_t) -> c_int {
    match open_with(path, Options::default(), out_db) {
        Ok(()) => ok_status(),
        Err(e) => err_status(e),
    }
}

/// `options_json` uses the keys `busy_timeout_ms`, `max_busy_sleep_ms` and
/// `close_on_drop`; missing keys keep their defaults, a null pointer means
/// all defaults.
#[unsafe(no_mangle)]
pub extern "C" fn ic_open_with_options(
    path: *const c_char,
    options_json: *const c_char,
    out_db: *mut *mut ic_db_t,
) -> c_int {
    let result = (|| -> ApiResult<()> {
        let options = if options_json.is_null() {
            Options::default()
        } else {
            let text = cstr_to_string(options_json, "options_json")?;
            Options::from_json(&text).map_err(ApiError::from_core)?
        };
        open_with(path, options, out_db)
    })();

    match result {
        Ok(()) => ok_status(),
        Err(e) => err_status(e),
    }
}

/// Ordinary close. Returns `IC_BUSY` while statements are outstanding. The
/// handle stays allocated; free it with `ic_db_release`.
#[unsafe(no_mangle)]
pub extern "C" fn ic_close(db: *mut ic_db_t) -> c_int {
    let result = (|| -> ApiResult<()> {
        let handle = unsafe { db_handle_ref(db)? };
        handle.conn.close().map_err(ApiError::from_core)
    })();

    match result {
        Ok(()) => ok_status(),
        Err(e) => err_status(e),
    }
}

/// Close the connection, tombstoning every outstanding statement. Those
/// statements must still be released with `ic_stmt_release`. The handle stays
/// allocated, so calling this again reports `IC_MISUSE`.
#[unsafe(no_mangle)]
pub extern "C" fn ic_force_close(db: *mut ic_db_t) -> c_int {
    let result = (|| -> ApiResult<()> {
        let handle = unsafe { db_handle_ref(db)? };
        handle.conn.force_close().map_err(ApiError::from_core)
    })();

    match result {
        Ok(()) => ok_status(),
        Err(e) => err_status(e),
    }
}

/// Free a connection handle, force-closing it first if it is still open. If
/// that fails the handle is left allocated and open.
#[unsafe(no_mangle)]
pub extern "C" fn ic_db_release(db: *mut ic_db_t) -> c_int {
    let result = (|| -> ApiResult<()> {
        if db.is_null() {
            return Ok(());
        }
        let handle = unsafe { db_handle_ref(db)? };
        if handle.conn.is_open() {
            handle.conn.force_close().map_err(ApiError::from_core)?;
        }
        unsafe {
            // SAFETY: pointer was allocated by this crate and ownership transferred to caller.
            drop(Box::from_raw(db.cast::<DbHandle>()));
        }
        Ok(())
    })();

    match result {
        Ok(()) => ok_status(),
        Err(e) => err_status(e),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn ic_prepare(
    db: *mut ic_db_t,
    sql: *const c_char,
    out_stmt: *mut *mut ic_stmt_t,
) -> c_int {
    let result = (|| -> ApiResult<()> {
        if out_stmt.is_null() {
            return Err(ApiError::null_pointer("out_stmt"));
        }
        let handle = unsafe { db_handle_ref(db)? };
        let sql = cstr_to_string(sql, "sql")?;
        let stmt = handle.conn.prepare(&sql).map_err(ApiError::from_core)?;
        unsafe {
            // SAFETY: out pointer validated above.
            *out_stmt = Box::into_raw(Box::new(StmtHandle { stmt })).cast::<ic_stmt_t>();
        }
        Ok(())
    })();

    match result {
        Ok(()) => ok_status(),
        Err(e) => err_status(e),
    }
}

fn stmt_bind_value(stmt: *mut ic_stmt_t, index: c_int, value: Value) -> c_int {
    let result = (|| -> ApiResult<()> {
        let handle = unsafe { stmt_handle_ref(stmt)? };
        let index = usize::try_from(index).map_err(|_| {
            ApiError::new(IC_RANGE, format!("parameter index {index} out of range"))
        })?;
        handle.stmt.bind(index, value).map_err(ApiError::from_core)
    })();
    match result {
        Ok(()) => ok_status(),
        Err(e) => err_status(e),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn ic_stmt_bind_null(stmt: *mut ic_stmt_t, index: c_int) -> c_int {
    stmt_bind_value(stmt, index, Value::Null)
}

#[unsafe(no_mangle)]
pub extern "C" fn ic_stmt_bind_int64(stmt: *mut ic_stmt_t, index: c_int, value: i64) -> c_int {
    stmt_bind_value(stmt, index, Value::Integer(value))
}

#[unsafe(no_mangle)]
pub extern "C" fn ic_stmt_bind_double(stmt: *mut ic_stmt_t, index: c_int, value: f64) -> c_int {
    stmt_bind_value(stmt, index, Value::Float(value))
}

#[unsafe(no_mangle)]
pub extern "C" fn ic_stmt_bind_text(
    stmt: *mut ic_stmt_t,
    index: c_int,
    value: *const c_char,
) -> c_int {
    let value = match cstr_to_string(value, "value") {
        Ok(v) => v,
        Err(e) => return err_status(e),
    };
    stmt_bind_value(stmt, index, Value::Text(value))
}

#[unsafe(no_mangle)]
pub extern "C" fn ic_stmt_bind_blob(
    stmt: *mut ic_stmt_t,
    index: c_int,
    data: *const c_void,
    len: usize,
) -> c_int {
    if data.is_null() && len > 0 {
        return err_status(ApiError::null_pointer("data"));
    }
    let bytes = if len == 0 {
        Vec::new()
    } else {
        unsafe {
            // SAFETY: caller guarantees `data` points at `len` readable bytes.
            std::slice::from_raw_parts(data.cast::<u8>(), len).to_vec()
        }
    };
    stmt_bind_value(stmt, index, Value::Blob(bytes))
}

/// Returns `IC_ROW` when a row is available, `IC_DONE` when finished, or an
/// error status.
#[unsafe(no_mangle)]
pub extern "C" fn ic_stmt_step(stmt: *mut ic_stmt_t) -> c_int {
    let result = (|| -> ApiResult<bool> {
        let handle = unsafe { stmt_handle_ref(stmt)? };
        handle.stmt.step().map_err(ApiError::from_core)
    })();
    match result {
        Ok(has_row) => {
            clear_last_error();
            if has_row { IC_ROW } else { IC_DONE }
        }
        Err(e) => err_status(e),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn ic_stmt_column_count(stmt: *mut ic_stmt_t) -> usize {
    let result = (|| -> ApiResult<usize> {
        let handle = unsafe { stmt_handle_ref(stmt)? };
        handle.stmt.column_count().map_err(ApiError::from_core)
    })();
    match result {
        Ok(v) => {
            clear_last_error();
            v
        }
        Err(e) => {
            set_last_error(&e);
            0
        }
    }
}

/// The current row as a JSON array. Free the string with `ic_string_free`.
#[unsafe(no_mangle)]
pub extern "C" fn ic_stmt_row_json(stmt: *mut ic_stmt_t, out_json: *mut *mut c_char) -> c_int {
    let result = (|| -> ApiResult<()> {
        let handle = unsafe { stmt_handle_ref(stmt)? };
        let row = handle.stmt.row_values().map_err(ApiError::from_core)?;
        let row = JsonValue::Array(row.into_iter().map(value_to_json).collect());
        let text = serde_json::to_string(&row)
            .map_err(|e| ApiError::internal(format!("json encode failed: {e}")))?;
        write_out_c_string(out_json, &text)
    })();
    match result {
        Ok(()) => ok_status(),
        Err(e) => err_status(e),
    }
}

#[unsafe(no_mangle)]
pub extern "C" fn ic_stmt_sql(stmt: *mut ic_stmt_t, out_sql: *mut *mut c_char) -> c_int {
    let result = (|| -> ApiResult<()> {
        let handle = unsafe { stmt_handle_ref(stmt)? };
        write_out_c_string(out_sql, handle.stmt.sql())
    })();
    match result {
        Ok(()) => ok_status(),
        Err(e) => err_status(e),
    }
}

/// Returns 1 for a tombstoned statement, 0 for a live one and -1 for a null
/// handle.
#[unsafe(no_mangle)]
pub extern "C" fn ic_stmt_is_tombstoned(stmt: *mut ic_stmt_t) -> c_int {
    let result = (|| -> ApiResult<bool> {
        let handle = unsafe { stmt_handle_ref(stmt)? };
        Ok(handle.stmt.is_tombstoned())
    })();
    match result {
        Ok(tombstoned) => {
            clear_last_error();
            c_int::from(tombstoned)
        }
        Err(e) => {
            set_last_error(&e);
            -1
        }
    }
}

/// Rewind a statement. A tombstoned statement reports `IC_SCHEMA`.
#[unsafe(no_mangle)]
pub extern "C" fn ic_stmt_reset(stmt: *mut ic_stmt_t) -> c_int {
    let result = (|| -> ApiResult<()> {
        let handle = unsafe { stmt_handle_ref(stmt)? };
        handle.stmt.reset().map_err(ApiError::from_core)
    })();
    match result {
        Ok(()) => ok_status(),
        Err(e) => err_status(e),
    }
}

/// Release a statement, live or tombstoned. Must be called exactly once per
/// statement; the handle is freed even when an error is returned.
#[unsafe(no_mangle)]
pub extern "C" fn ic_stmt_release(stmt: *mut ic_stmt_t) -> c_int {
    let result = (|| -> ApiResult<()> {
        if stmt.is_null() {
            return Ok(());
        }
        let handle = unsafe {
            // SAFETY: pointer was allocated by this crate and ownership transferred to caller.
            Box::from_raw(stmt.cast::<StmtHandle>())
        };
        handle.stmt.release().map_err(ApiError::from_core)
    })();
    match result {
        Ok(()) => ok_status(),
        Err(e) => err_status(e),
    }
}

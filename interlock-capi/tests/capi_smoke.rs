use std::ffi::{CStr, CString};
use std::os::raw::c_char;
use std::ptr;

use interlock_capi::{
    IC_BUSY, IC_DONE, IC_ERROR, IC_MISUSE, IC_OK, IC_ROW, IC_SCHEMA, ic_close, ic_db_release, ic_db_t,
    ic_force_close, ic_last_error_code, ic_last_error_message, ic_open, ic_open_with_options,
    ic_prepare, ic_stmt_bind_int64, ic_stmt_bind_text, ic_stmt_column_count,
    ic_stmt_is_tombstoned, ic_stmt_release, ic_stmt_reset, ic_stmt_row_json, ic_stmt_sql,
    ic_stmt_step, ic_stmt_t, ic_string_free,
};

fn take_string(ptr: *mut c_char) -> String {
    assert!(!ptr.is_null());
    let text = unsafe { CStr::from_ptr(ptr) }
        .to_str()
        .expect("utf8")
        .to_string();
    ic_string_free(ptr);
    text
}

fn last_message() -> String {
    let mut buf = vec![0 as c_char; 256];
    let len = ic_last_error_message(buf.as_mut_ptr(), buf.len());
    assert!(len > 0);
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_str()
        .expect("message utf8")
        .to_string()
}

fn open_db() -> *mut ic_db_t {
    let dir = tempfile::tempdir().expect("tempdir");
    let db_path = dir.path().join("capi-smoke.db");
    let db_path = CString::new(db_path.to_string_lossy().to_string()).expect("db path cstr");

    let mut db: *mut ic_db_t = ptr::null_mut();
    assert_eq!(ic_open(db_path.as_ptr(), &mut db), IC_OK);
    assert!(!db.is_null());
    db
}

fn prepare(db: *mut ic_db_t, sql: &str) -> *mut ic_stmt_t {
    let sql = CString::new(sql).expect("sql cstr");
    let mut stmt: *mut ic_stmt_t = ptr::null_mut();
    assert_eq!(ic_prepare(db, sql.as_ptr(), &mut stmt), IC_OK);
    assert!(!stmt.is_null());
    stmt
}

#[test]
fn capi_force_close_with_outstanding_statements() {
    let db = open_db();
    let running = prepare(db, r#"[[1, "a"], [2, "b"]]"#);
    let idle = prepare(db, r#"[[{"param": 1}, {"param": 2}]]"#);

    assert_eq!(ic_stmt_step(running), IC_ROW);
    let mut json: *mut c_char = ptr::null_mut();
    assert_eq!(ic_stmt_row_json(running, &mut json), IC_OK);
    assert_eq!(take_string(json), r#"[1,"a"]"#);

    let text = CString::new("hello").expect("text cstr");
    assert_eq!(ic_stmt_bind_int64(idle, 1, 7), IC_OK);
    assert_eq!(ic_stmt_bind_text(idle, 2, text.as_ptr()), IC_OK);
    assert_eq!(ic_stmt_column_count(idle), 2);

    assert_eq!(ic_close(db), IC_BUSY);
    assert_eq!(ic_last_error_code(), IC_BUSY);
    assert!(last_message().contains("unfinalized statements"));

    assert_eq!(ic_force_close(db), IC_OK);
    assert_eq!(ic_stmt_is_tombstoned(running), 1);
    assert_eq!(ic_stmt_is_tombstoned(idle), 1);

    assert_eq!(ic_stmt_reset(running), IC_SCHEMA);
    assert_eq!(ic_stmt_step(idle), IC_SCHEMA);
    let mut sql: *mut c_char = ptr::null_mut();
    assert_eq!(ic_stmt_sql(running, &mut sql), IC_OK);
    assert_eq!(take_string(sql), r#"[[1, "a"], [2, "b"]]"#);

    assert_eq!(ic_force_close(db), IC_MISUSE);

    assert_eq!(ic_stmt_release(running), IC_OK);
    assert_eq!(ic_stmt_release(idle), IC_OK);
    assert_eq!(ic_db_release(db), IC_OK);
}

#[test]
fn capi_live_statement_release_and_plain_close() {
    let db = open_db();
    let stmt = prepare(db, "[[1], [2]]");

    assert_eq!(ic_stmt_is_tombstoned(stmt), 0);
    assert_eq!(ic_stmt_step(stmt), IC_ROW);
    assert_eq!(ic_stmt_step(stmt), IC_ROW);
    assert_eq!(ic_stmt_step(stmt), IC_DONE);
    assert_eq!(ic_stmt_reset(stmt), IC_OK);
    assert_eq!(ic_stmt_step(stmt), IC_ROW);

    assert_eq!(ic_stmt_release(stmt), IC_OK);
    assert_eq!(ic_close(db), IC_OK);
    assert_eq!(ic_close(db), IC_MISUSE);
    assert_eq!(ic_db_release(db), IC_OK);
}

#[test]
fn capi_release_frees_an_open_connection() {
    let db = open_db();
    let stmt = prepare(db, "[[1]]");

    assert_eq!(ic_db_release(db), IC_OK);
    assert_eq!(ic_stmt_is_tombstoned(stmt), 1);
    assert_eq!(ic_stmt_release(stmt), IC_OK);
}

#[test]
fn capi_prepare_rejects_oversized_parameter_index() {
    let db = open_db();
    let sql = CString::new(r#"[[{"param": 18446744073709551615}]]"#).expect("sql cstr");
    let mut stmt: *mut ic_stmt_t = ptr::null_mut();

    assert_eq!(ic_prepare(db, sql.as_ptr(), &mut stmt), IC_ERROR);
    assert!(stmt.is_null());
    assert_eq!(ic_last_error_code(), IC_ERROR);

    assert_eq!(ic_close(db), IC_OK);
    assert_eq!(ic_db_release(db), IC_OK);
}

#[test]
fn capi_open_with_options() {
    let path = CString::new(":memory:").expect("path cstr");
    let options = CString::new(r#"{"busy_timeout_ms": 100}"#).expect("options cstr");
    let mut db: *mut ic_db_t = ptr::null_mut();
    assert_eq!(
        ic_open_with_options(path.as_ptr(), options.as_ptr(), &mut db),
        IC_OK
    );
    assert_eq!(ic_db_release(db), IC_OK);

    let bad = CString::new(r#"{"busy_timeout": 100}"#).expect("options cstr");
    let mut db: *mut ic_db_t = ptr::null_mut();
    assert_eq!(
        ic_open_with_options(path.as_ptr(), bad.as_ptr(), &mut db),
        IC_MISUSE
    );
    assert!(db.is_null());
    assert!(last_message().starts_with("invalid options"));
}

#[test]
fn capi_null_handles_are_misuse() {
    assert_eq!(ic_stmt_step(ptr::null_mut()), IC_MISUSE);
    assert_eq!(ic_force_close(ptr::null_mut()), IC_MISUSE);
    assert_eq!(ic_stmt_is_tombstoned(ptr::null_mut()), -1);
    assert_eq!(ic_stmt_release(ptr::null_mut()), IC_OK);
    assert_eq!(ic_db_release(ptr::null_mut()), IC_OK);
}

//! # Row and Parameter Conversion
//!
//! Statements cross the store boundary as text plus positional JSON
//! parameters, and rows come back as JSON records. This module converts
//! between those values and SQLite's storage classes.
//!
//! ```text
//!   JSON value              SQLite storage class
//!   ──────────              ────────────────────
//!   null            ◄──►    NULL
//!   bool            ───►    INTEGER 0/1
//!   integer number  ◄──►    INTEGER
//!   float number    ◄──►    REAL
//!   string          ◄──►    TEXT
//!   array / object  ───►    TEXT (serialized JSON)
//!   array of bytes  ◄───    BLOB
//! ```

use harbor_core::Record;
use serde_json::{Number, Value};
use sqlx::query::Query;
use sqlx::sqlite::{SqliteArguments, SqliteRow};
use sqlx::{Column, Row, Sqlite, TypeInfo, ValueRef};

use crate::error::DbResult;

/// A runtime query with its arguments not yet bound.
pub type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Builds a query from statement text and binds every positional parameter.
pub fn bind_params<'q>(sql: &'q str, params: &[Value]) -> SqliteQuery<'q> {
    params
        .iter()
        .fold(sqlx::query(sql), |query, value| bind_value(query, value))
}

fn bind_value<'q>(query: SqliteQuery<'q>, value: &Value) -> SqliteQuery<'q> {
    match value {
        Value::Null => query.bind(None::<String>),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        other => query.bind(other.to_string()),
    }
}

/// Converts one result row into a record keyed by column name.
pub fn row_to_record(row: &SqliteRow) -> DbResult<Record> {
    let mut record = Record::new();

    for (idx, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(idx)?;

        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage = raw.type_info().name().to_string();
            match storage.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get::<i64, _>(idx)?),
                "REAL" => {
                    let f: f64 = row.try_get(idx)?;
                    Number::from_f64(f).map(Value::Number).unwrap_or(Value::Null)
                }
                "BLOB" => Value::from(row.try_get::<Vec<u8>, _>(idx)?),
                _ => Value::String(row.try_get::<String, _>(idx)?),
            }
        };

        record.insert(column.name().to_string(), value);
    }

    Ok(record)
}

/// Returns true if `name` is safe to splice into statement text.
///
/// Table and column names cannot be bound as parameters, so the convenience
/// wrappers only accept `[A-Za-z_][A-Za-z0-9_]*`.
pub fn is_valid_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

//! Statement execution against either the pool or an ambient transaction.
//!
//! Every driver error crosses back through [`map_db_err`] here; nothing
//! above this module sees a raw `sqlx::Error`.

use async_lock::MutexGuardArc;
use log::{debug, trace};
use sqlx::pool::PoolConnection;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool, SqliteRow};
use sqlx::{Row, TypeInfo, ValueRef};

use crate::error::{map_db_err, FractalError, Result};
use crate::transaction::SharedTxn;
use crate::value::Value;

/// Where a collection handle sends its statements.
#[derive(Clone)]
pub(crate) enum Conn {
    Pool(SqlitePool),
    Txn(SharedTxn),
}

/// An acquired connection; both variants expose the same raw connection.
pub(crate) enum ConnGuard {
    Pool(PoolConnection<Sqlite>),
    Txn(MutexGuardArc<sqlx::Transaction<'static, Sqlite>>),
}

impl ConnGuard {
    pub fn conn(&mut self) -> &mut sqlx::SqliteConnection {
        match self {
            Self::Pool(conn) => conn,
            Self::Txn(guard) => &mut **guard,
        }
    }
}

impl Conn {
    pub async fn acquire(&self) -> Result<ConnGuard> {
        match self {
            Self::Pool(pool) => {
                if pool.is_closed() {
                    return Err(FractalError::invalid("database is closed"));
                }
                let conn = pool.acquire().await.map_err(|e| map_db_err(e, None))?;
                Ok(ConnGuard::Pool(conn))
            }
            Self::Txn(shared) => Ok(ConnGuard::Txn(shared.lock_arc().await)),
        }
    }
}

fn bind_params<'q>(
    mut query: sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>,
    params: &[(String, Value)],
) -> sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>> {
    for (_, value) in params {
        query = match value {
            Value::Null => query.bind(None::<String>),
            Value::Bool(b) => query.bind(*b),
            Value::Int(i) => query.bind(*i),
            Value::Float(f) => query.bind(*f),
            Value::Text(s) => query.bind(s.clone()),
            Value::Blob(b) => query.bind(b.clone()),
            Value::Array(_) => query.bind(value.to_json().to_string()),
        };
    }
    query
}

/// Rewrites the crate's `@name` bind markers into anonymous `?`
/// placeholders, which is the only form sqlx's SQLite driver accepts at
/// runtime. Parameters are still bound positionally in `bind_params`, so
/// this is purely a textual substitution done right before handing the
/// statement to sqlx.
fn positionalize(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    let mut chars = sql.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '@' {
            out.push('?');
            while matches!(chars.peek(), Some(nc) if nc.is_alphanumeric() || *nc == '_') {
                chars.next();
            }
        } else {
            out.push(c);
        }
    }
    out
}

pub(crate) async fn execute(
    conn: &mut sqlx::SqliteConnection,
    sql: &str,
    params: &[(String, Value)],
) -> Result<u64> {
    debug!("execute: {}", sql);
    trace!("execute: {} params", params.len());
    let result = bind_params(sqlx::query(&positionalize(sql)), params)
        .execute(conn)
        .await
        .map_err(|e| map_db_err(e, Some(sql)))?;
    Ok(result.rows_affected())
}

pub(crate) async fn fetch_all(
    conn: &mut sqlx::SqliteConnection,
    sql: &str,
    params: &[(String, Value)],
) -> Result<Vec<SqliteRow>> {
    debug!("fetch_all: {}", sql);
    bind_params(sqlx::query(&positionalize(sql)), params)
        .fetch_all(conn)
        .await
        .map_err(|e| map_db_err(e, Some(sql)))
}

pub(crate) async fn fetch_optional(
    conn: &mut sqlx::SqliteConnection,
    sql: &str,
    params: &[(String, Value)],
) -> Result<Option<SqliteRow>> {
    debug!("fetch_optional: {}", sql);
    bind_params(sqlx::query(&positionalize(sql)), params)
        .fetch_optional(conn)
        .await
        .map_err(|e| map_db_err(e, Some(sql)))
}

/// Decodes a column into a [`Value`] using the declared type of the slot.
pub(crate) fn column_to_value(row: &SqliteRow, idx: usize) -> Result<Value> {
    let raw = row.try_get_raw(idx).map_err(|e| map_db_err(e, None))?;
    if raw.is_null() {
        return Ok(Value::Null);
    }
    let type_name = raw.type_info().name().to_owned();
    let value = match type_name.as_str() {
        "TEXT" => Value::Text(row.try_get::<String, _>(idx).map_err(|e| map_db_err(e, None))?),
        "INTEGER" => Value::Int(row.try_get::<i64, _>(idx).map_err(|e| map_db_err(e, None))?),
        "REAL" => Value::Float(row.try_get::<f64, _>(idx).map_err(|e| map_db_err(e, None))?),
        "BLOB" => Value::Blob(row.try_get::<Vec<u8>, _>(idx).map_err(|e| map_db_err(e, None))?),
        "NULL" => Value::Null,
        other => {
            return Err(FractalError::query(format!(
                "cannot decode column of type {}",
                other
            )))
        }
    };
    Ok(value)
}
